use super::{normalize_lfn, DigsClient};
use crate::{ControlCommand, DigsError, DigsResult};

impl DigsClient {
    fn precondition(&self, holds: bool, message: String) -> DigsResult<()> {
        if holds {
            Ok(())
        } else {
            Err(DigsError::PreconditionFailed(message))
        }
    }

    pub async fn retire_node(&self, node: &str) -> DigsResult<()> {
        self.ensure_main()?;
        self.precondition(
            !self.is_node_retiring(node)?,
            format!("Node {} is already retiring", node),
        )?;
        self.send(ControlCommand::Retire {
            node: node.to_string(),
        })
        .await?;
        self.with_nodes_mut(|n| {
            n.node_mut(node)?.retiring = true;
            Ok(())
        })
    }

    pub async fn unretire_node(&self, node: &str) -> DigsResult<()> {
        self.ensure_main()?;
        self.precondition(
            self.is_node_retiring(node)?,
            format!("Node {} is not retiring", node),
        )?;
        self.send(ControlCommand::Unretire {
            node: node.to_string(),
        })
        .await?;
        self.with_nodes_mut(|n| {
            n.node_mut(node)?.retiring = false;
            Ok(())
        })
    }

    pub async fn disable_node(&self, node: &str) -> DigsResult<()> {
        self.ensure_main()?;
        self.precondition(
            !self.is_node_disabled(node)?,
            format!("Node {} is already disabled", node),
        )?;
        self.send(ControlCommand::Disable {
            node: node.to_string(),
        })
        .await?;
        self.with_nodes_mut(|n| {
            n.node_mut(node)?.disabled = true;
            Ok(())
        })
    }

    pub async fn enable_node(&self, node: &str) -> DigsResult<()> {
        self.ensure_main()?;
        self.precondition(
            self.is_node_disabled(node)?,
            format!("Node {} is already enabled", node),
        )?;
        self.send(ControlCommand::Enable {
            node: node.to_string(),
        })
        .await?;
        self.with_nodes_mut(|n| {
            n.node_mut(node)?.disabled = false;
            Ok(())
        })
    }

    /// The node joins the local registry only after the next connect.
    pub async fn add_node(&self, node: &str, site: &str, path: &str) -> DigsResult<()> {
        self.ensure_main()?;
        let known = self.with_nodes(|n| Ok(n.contains(node)))?;
        self.precondition(!known, format!("Node {} is already on grid", node))?;
        self.send(ControlCommand::Add {
            node: node.to_string(),
            site: site.to_string(),
            path: path.to_string(),
        })
        .await
    }

    /// Logical files whose only copy lives on `node`.
    pub async fn files_at_risk(&self, node: &str) -> DigsResult<Vec<String>> {
        let files = self.registry.get_file_list("*").await?;
        Ok(files
            .into_iter()
            .filter(|(_, locations)| locations.len() == 1 && locations[0] == node)
            .map(|(lfn, _)| lfn)
            .collect())
    }

    /// Callers wanting confirmation check `files_at_risk` first.
    pub async fn remove_node(&self, node: &str) -> DigsResult<()> {
        self.ensure_main()?;
        self.send(ControlCommand::Remove {
            node: node.to_string(),
        })
        .await
    }

    pub async fn delete_file(&self, lfn: &str) -> DigsResult<()> {
        self.ensure_main()?;
        let lfn = normalize_lfn(lfn);
        if !self.registry.lfn_exists(&lfn).await? {
            return Err(DigsError::NotFound(format!(
                "File {} does not exist on grid",
                lfn
            )));
        }
        self.send(ControlCommand::Delete { lfn }).await?;
        self.request_cache_refresh();
        Ok(())
    }

    pub async fn delete_directory(&self, ldn: &str) -> DigsResult<()> {
        self.ensure_main()?;
        let ldn = normalize_lfn(ldn);
        if self.registry.lfn_exists(&ldn).await? {
            return Err(DigsError::InvalidParam(format!("{} is a regular file", ldn)));
        }
        self.send(ControlCommand::RemoveDirectory { lfn: ldn.clone() })
            .await?;
        self.new_folders.remove(&ldn);
        self.request_cache_refresh();
        Ok(())
    }

    pub async fn set_permissions(&self, lfn: &str, public: bool, recursive: bool) -> DigsResult<()> {
        self.ensure_main()?;
        let lfn = normalize_lfn(lfn);
        if !self.registry.lfn_exists(&lfn).await? {
            return Err(DigsError::NotFound(format!(
                "File {} does not exist on grid",
                lfn
            )));
        }
        self.send(ControlCommand::Chmod {
            recursive,
            group: self.user_group(),
            lfn,
            public,
        })
        .await
    }
}
