use digs_lib::{
    ClientOptions, DigsClient, DigsError, DigsResult, DirectoryLockReport, DirectoryReplicaReport,
    ListOptions, LockStatus, NetworkTransport, ProgressCallbackResult, ReplicaCountSetting,
    TransferContext, TransferMonitor, UserIdentity,
};
use log::{debug, error, LevelFilter};
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;

const DN_ENV: &str = "DIGS_USER_DN";
const GROUP_ENV: &str = "DIGS_GROUP";
const MAX_LISTED_AT_RISK: usize = 10;

fn usage() -> String {
    format!(
        "usage: digs-tool [-v] [--settings <path>] [--dn <subject>] <command> [arguments]\n\
         commands:\n\
         \x20 setnodes <main node> <main path> [<backup node> <backup path>]\n\
         \x20 ping\n\
         \x20 put [-R] <local file> <grid file>\n\
         \x20 get [-R] <grid file> <local file>\n\
         \x20 delete [-R] <grid file>\n\
         \x20 touch [-R] <grid file> [<storage node>]\n\
         \x20 lock [-R] [-c] <grid file>\n\
         \x20 unlock [-R] <grid file>\n\
         \x20 replcount [-R] [-c] [-d] <grid file> [<count>]\n\
         \x20 add <node> <site> <path>\n\
         \x20 remove [-y] <node>\n\
         \x20 enable|disable|retire|unretire <node>\n\
         \x20 makepublic|makeprivate [-R] <grid file>\n\
         \x20 list [-l -n -w -g -c -s -p -o] <pattern> | -W <node> | -O <submitter> | -G <group> | -P <group> <permissions>\n\
         the caller subject defaults to ${}, the group to ${}",
        DN_ENV, GROUP_ENV
    )
}

enum ListRequest {
    Pattern { pattern: String, options: ListOptions },
    Node(String),
    Submitter(String),
    Group(String),
    Permissions(String, String),
}

enum Command {
    SetNodes {
        main: (String, String),
        backup: Option<(String, String)>,
    },
    Ping,
    Put { recursive: bool, local: PathBuf, lfn: String },
    Get { recursive: bool, lfn: String, local: PathBuf },
    Delete { recursive: bool, lfn: String },
    Touch { recursive: bool, lfn: String, host: Option<String> },
    Lock { recursive: bool, check: bool, lfn: String },
    Unlock { recursive: bool, lfn: String },
    ReplicaCount {
        recursive: bool,
        check: bool,
        clear: bool,
        lfn: String,
        count: Option<u32>,
    },
    Add { node: String, site: String, path: String },
    Remove { node: String, confirmed: bool },
    Enable(String),
    Disable(String),
    Retire(String),
    Unretire(String),
    Permissions { public: bool, recursive: bool, lfn: String },
    List(ListRequest),
}

struct ToolArgs {
    verbose: bool,
    settings_path: Option<PathBuf>,
    dn: Option<String>,
    command: Command,
}

/// Splits `-x` switches from positional arguments.
fn split_switches(args: &[String], allowed: &str) -> Result<(Vec<char>, Vec<String>), String> {
    let mut switches = Vec::new();
    let mut positional = Vec::new();
    for arg in args {
        if arg == "--recursive" {
            switches.push('R');
        } else if arg.len() > 1 && arg.starts_with('-') {
            for c in arg[1..].chars() {
                if !allowed.contains(c) {
                    return Err(format!("unknown switch -{}\n{}", c, usage()));
                }
                switches.push(c);
            }
        } else {
            positional.push(arg.clone());
        }
    }
    Ok((switches, positional))
}

fn arity(name: &str, positional: &[String], min: usize, max: usize) -> Result<(), String> {
    if positional.len() < min || positional.len() > max {
        return Err(format!("wrong number of arguments for {}\n{}", name, usage()));
    }
    Ok(())
}

fn parse_list(args: &[String]) -> Result<ListRequest, String> {
    let special = |i: usize| {
        args.get(i)
            .cloned()
            .ok_or_else(|| format!("missing value for list {}\n{}", args[0], usage()))
    };
    match args.first().map(|s| s.as_str()) {
        Some("-W") => return Ok(ListRequest::Node(special(1)?)),
        Some("-O") => return Ok(ListRequest::Submitter(special(1)?)),
        Some("-G") => return Ok(ListRequest::Group(special(1)?)),
        Some("-P") => return Ok(ListRequest::Permissions(special(1)?, special(2)?)),
        _ => {}
    }

    let (switches, positional) = split_switches(args, "lnwgcspo")?;
    arity("list", &positional, 0, 1)?;
    let mut options = ListOptions::default();
    for c in switches {
        let flag = match c {
            'l' => ListOptions::LONG,
            'n' => ListOptions::NUM_COPIES,
            'w' => ListOptions::LOCATIONS,
            'g' => ListOptions::GROUP,
            'c' => ListOptions::CHECKSUM,
            's' => ListOptions::SIZE,
            'p' => ListOptions::PERMISSIONS,
            _ => ListOptions::SUBMITTER,
        };
        options = options.with(flag);
    }
    Ok(ListRequest::Pattern {
        pattern: positional.first().cloned().unwrap_or_else(|| "*".to_string()),
        options,
    })
}

fn parse_command(name: &str, rest: &[String]) -> Result<Command, String> {
    let node_arg = |rest: &[String]| -> Result<String, String> {
        arity(name, rest, 1, 1)?;
        Ok(rest[0].clone())
    };

    let command = match name {
        "setnodes" => {
            if rest.len() != 2 && rest.len() != 4 {
                return Err(format!("wrong number of arguments for setnodes\n{}", usage()));
            }
            Command::SetNodes {
                main: (rest[0].clone(), rest[1].clone()),
                backup: (rest.len() == 4).then(|| (rest[2].clone(), rest[3].clone())),
            }
        }
        "ping" => {
            arity(name, rest, 0, 0)?;
            Command::Ping
        }
        "put" | "get" => {
            let (switches, p) = split_switches(rest, "R")?;
            arity(name, &p, 2, 2)?;
            let recursive = switches.contains(&'R');
            if name == "put" {
                Command::Put {
                    recursive,
                    local: PathBuf::from(&p[0]),
                    lfn: p[1].clone(),
                }
            } else {
                Command::Get {
                    recursive,
                    lfn: p[0].clone(),
                    local: PathBuf::from(&p[1]),
                }
            }
        }
        "delete" | "unlock" | "makepublic" | "makeprivate" => {
            let (switches, p) = split_switches(rest, "R")?;
            arity(name, &p, 1, 1)?;
            let recursive = switches.contains(&'R');
            let lfn = p[0].clone();
            match name {
                "delete" => Command::Delete { recursive, lfn },
                "unlock" => Command::Unlock { recursive, lfn },
                _ => Command::Permissions {
                    public: name == "makepublic",
                    recursive,
                    lfn,
                },
            }
        }
        "touch" => {
            let (switches, p) = split_switches(rest, "R")?;
            arity(name, &p, 1, 2)?;
            Command::Touch {
                recursive: switches.contains(&'R'),
                lfn: p[0].clone(),
                host: p.get(1).cloned(),
            }
        }
        "lock" => {
            let (switches, p) = split_switches(rest, "Rc")?;
            arity(name, &p, 1, 1)?;
            Command::Lock {
                recursive: switches.contains(&'R'),
                check: switches.contains(&'c'),
                lfn: p[0].clone(),
            }
        }
        "replcount" => {
            let (switches, p) = split_switches(rest, "Rcd")?;
            let check = switches.contains(&'c');
            let clear = switches.contains(&'d');
            if check || clear {
                arity(name, &p, 1, 1)?;
            } else {
                arity(name, &p, 2, 2)?;
            }
            let count = match p.get(1) {
                Some(v) => Some(
                    v.parse::<u32>()
                        .map_err(|_| format!("invalid replication count {}", v))?,
                ),
                None => None,
            };
            Command::ReplicaCount {
                recursive: switches.contains(&'R'),
                check,
                clear,
                lfn: p[0].clone(),
                count,
            }
        }
        "add" => {
            arity(name, rest, 3, 3)?;
            Command::Add {
                node: rest[0].clone(),
                site: rest[1].clone(),
                path: rest[2].clone(),
            }
        }
        "remove" => {
            let (switches, p) = split_switches(rest, "y")?;
            Command::Remove {
                node: node_arg(&p[..])?,
                confirmed: switches.contains(&'y'),
            }
        }
        "enable" => Command::Enable(node_arg(rest)?),
        "disable" => Command::Disable(node_arg(rest)?),
        "retire" => Command::Retire(node_arg(rest)?),
        "unretire" => Command::Unretire(node_arg(rest)?),
        "list" => Command::List(parse_list(rest)?),
        other => return Err(format!("unrecognised command '{}'\n{}", other, usage())),
    };
    Ok(command)
}

fn parse_args() -> Result<ToolArgs, String> {
    let args = env::args().skip(1).collect::<Vec<String>>();
    if args.is_empty() || args[0] == "-h" || args[0] == "--help" {
        return Err(usage());
    }

    let mut verbose = false;
    let mut settings_path = None;
    let mut dn = None;
    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "-v" => verbose = true,
            "--settings" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --settings".to_string())?;
                settings_path = Some(PathBuf::from(value));
            }
            "--dn" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --dn".to_string())?;
                dn = Some(value.clone());
            }
            _ => break,
        }
        i += 1;
    }

    let name = args
        .get(i)
        .ok_or_else(|| format!("missing command\n{}", usage()))?;
    let command = parse_command(name, &args[i + 1..])?;
    Ok(ToolArgs {
        verbose,
        settings_path,
        dn,
        command,
    })
}

struct ProgressLogger {
    what: String,
}

impl TransferMonitor for ProgressLogger {
    fn update_bytes_transferred(&self, transferred: u64, total: Option<u64>) -> ProgressCallbackResult {
        match total {
            Some(total) => debug!("{}: {}/{} bytes", self.what, transferred, total),
            None => debug!("{}: {} bytes", self.what, transferred),
        }
        ProgressCallbackResult::Continue
    }
}

fn transfer_context(what: &str) -> TransferContext {
    TransferContext::with_monitor(Arc::new(ProgressLogger {
        what: what.to_string(),
    }))
}

async fn confirm(prompt: &str) -> DigsResult<bool> {
    println!("{}", prompt);
    let mut line = String::new();
    tokio::io::BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await?;
    Ok(matches!(line.trim(), "y" | "Y"))
}

async fn remove_node(client: &DigsClient, node: &str, confirmed: bool) -> DigsResult<()> {
    let at_risk = client.files_at_risk(node).await?;
    if at_risk.is_empty() {
        println!("All files are duplicated, removing node...");
    } else {
        for lfn in at_risk.iter().take(MAX_LISTED_AT_RISK) {
            println!("File {} is at risk", lfn);
        }
        if at_risk.len() > MAX_LISTED_AT_RISK {
            println!("...more files at risk...");
        }
        println!("\n{} files are only present on {}", at_risk.len(), node);
        if !confirmed && !confirm("Are you sure you want to remove this node? (Y/N)").await? {
            println!("Remove operation cancelled by user");
            return Ok(());
        }
    }
    client.remove_node(node).await
}

async fn run_list(client: &DigsClient, request: ListRequest) -> DigsResult<()> {
    let names = match request {
        ListRequest::Pattern { pattern, options } => {
            for entry in client.list(&pattern, options).await? {
                println!("{}", entry.render());
            }
            return Ok(());
        }
        ListRequest::Node(node) => client.list_by_node(&node).await?,
        ListRequest::Submitter(dn) => client.list_by_submitter(&dn).await?,
        ListRequest::Group(group) => client.list_by_group(&group).await?,
        ListRequest::Permissions(group, perms) => {
            client.list_by_permissions(&group, &perms).await?
        }
    };
    for lfn in names {
        println!("{}", lfn);
    }
    Ok(())
}

async fn check_lock(client: &DigsClient, lfn: &str, recursive: bool) -> DigsResult<()> {
    if !recursive {
        match client.check_lock(lfn).await? {
            LockStatus::Unlocked => println!("File {} is not locked", lfn),
            LockStatus::LockedBy(dn) => println!("File {} is locked by {}", lfn, dn),
        }
        return Ok(());
    }
    match client.check_directory_lock(lfn).await? {
        DirectoryLockReport::Unlocked => println!("Directory {} is unlocked", lfn),
        DirectoryLockReport::LockedBy(dn) => println!("Directory {} is locked by {}", lfn, dn),
        DirectoryLockReport::Mixed(files) => {
            for (file, status) in files {
                match status {
                    LockStatus::Unlocked => println!("File {} is not locked", file),
                    LockStatus::LockedBy(dn) => println!("File {} is locked by {}", file, dn),
                }
            }
        }
    }
    Ok(())
}

async fn check_replica_count(client: &DigsClient, lfn: &str, recursive: bool) -> DigsResult<()> {
    if !recursive {
        match client.check_replica_count(lfn).await? {
            ReplicaCountSetting::Default(n) => {
                println!("Replication count for {} defaults to {}", lfn, n)
            }
            ReplicaCountSetting::Explicit(n) => println!("Replication count for {} is {}", lfn, n),
        }
        return Ok(());
    }
    match client.check_directory_replica_count(lfn).await? {
        DirectoryReplicaReport::Uniform(n) => {
            println!("Directory {} replication count is {}", lfn, n)
        }
        DirectoryReplicaReport::Mixed { default, overrides } => {
            println!("Files in {} default to replication count {}", lfn, default);
            for (file, n) in overrides {
                println!("Replication count for {} is {}", file, n);
            }
        }
    }
    Ok(())
}

async fn run_command(client: &DigsClient, command: Command) -> DigsResult<()> {
    match command {
        Command::SetNodes { .. } => Ok(()),
        Command::Ping => {
            if client.ping().await {
                println!("Main node is up");
                Ok(())
            } else {
                Err(DigsError::Connection("Main node is not responding".to_string()))
            }
        }
        Command::Put {
            recursive,
            local,
            lfn,
        } => {
            let ctx = transfer_context(&lfn);
            if recursive {
                let stored = client.put_directory(&local, &lfn, &ctx).await?;
                println!("{} files stored under {}", stored.len(), lfn);
            } else {
                let node = client.put_file(&local, &lfn, &ctx).await?;
                println!("{} => {} on {}", local.display(), lfn, node);
            }
            Ok(())
        }
        Command::Get {
            recursive,
            lfn,
            local,
        } => {
            let ctx = transfer_context(&lfn);
            if recursive {
                let written = client.get_directory(&lfn, &local, &ctx).await?;
                println!("{} files retrieved into {}", written.len(), local.display());
                Ok(())
            } else {
                client.get_file(&lfn, &local, &ctx).await
            }
        }
        Command::Delete { recursive, lfn } => {
            if recursive {
                client.delete_directory(&lfn).await
            } else {
                client.delete_file(&lfn).await
            }
        }
        Command::Touch {
            recursive,
            lfn,
            host,
        } => {
            let node = if recursive {
                client.touch_directory(&lfn, host.as_deref()).await?
            } else {
                client.touch_file(&lfn, host.as_deref()).await?
            };
            println!("Requested another copy of {} on {}", lfn, node);
            Ok(())
        }
        Command::Lock {
            recursive,
            check,
            lfn,
        } => match (check, recursive) {
            (true, _) => check_lock(client, &lfn, recursive).await,
            (false, true) => client.lock_directory(&lfn).await,
            (false, false) => client.lock_file(&lfn).await,
        },
        Command::Unlock { recursive, lfn } => {
            if recursive {
                client.unlock_directory(&lfn).await
            } else {
                client.unlock_file(&lfn).await
            }
        }
        Command::ReplicaCount {
            recursive,
            check,
            clear,
            lfn,
            count,
        } => {
            if check {
                return check_replica_count(client, &lfn, recursive).await;
            }
            let count = if clear { None } else { count };
            if recursive {
                client.set_directory_replica_count(&lfn, count).await
            } else {
                client.set_replica_count(&lfn, count).await
            }
        }
        Command::Add { node, site, path } => client.add_node(&node, &site, &path).await,
        Command::Remove { node, confirmed } => remove_node(client, &node, confirmed).await,
        Command::Enable(node) => client.enable_node(&node).await,
        Command::Disable(node) => client.disable_node(&node).await,
        Command::Retire(node) => client.retire_node(&node).await,
        Command::Unretire(node) => client.unretire_node(&node).await,
        Command::Permissions {
            public,
            recursive,
            lfn,
        } => client.set_permissions(&lfn, public, recursive).await,
        Command::List(request) => run_list(client, request).await,
    }
}

async fn run(args: ToolArgs) -> DigsResult<()> {
    let dn = args
        .dn
        .or_else(|| env::var(DN_ENV).ok())
        .unwrap_or_default();
    let mut identity = UserIdentity::new(&dn);
    if let Ok(group) = env::var(GROUP_ENV) {
        identity = identity.with_group(&group);
    }
    let mut options = ClientOptions::new(identity);
    if let Some(path) = &args.settings_path {
        options = options.with_settings_path(path);
    }
    let transport = Arc::new(NetworkTransport::new());

    let client = match &args.command {
        Command::SetNodes { main, backup } => {
            let backup = backup.as_ref().map(|(n, p)| (n.as_str(), p.as_str()));
            let client = DigsClient::connect_to(
                transport,
                options,
                (main.0.as_str(), main.1.as_str()),
                backup,
            )
            .await?;
            println!("Connected to grid via {}", client.grid_node().0);
            client
        }
        _ => DigsClient::connect(transport, options).await?,
    };

    let result = run_command(&client, args.command).await;
    client.close();
    result
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    if let Err(e) = TermLogger::init(
        level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    ) {
        eprintln!("init logger failed: {}", e);
    }
}

#[tokio::main]
async fn main() {
    let args = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };
    init_logging(args.verbose);

    if let Err(err) = run(args).await {
        error!("digs-tool failed: {}", err);
        std::process::exit(1);
    }
}
