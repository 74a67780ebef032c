use crate::action::{Action, ExecMode};
use crate::types::VERSION;

pub fn get_program_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().to_string()))
        .unwrap_or_else(|| "tabcoord".to_string())
        .to_lowercase()
        .replace(".exe", "")
}

pub fn print_help() {
    let prog = get_program_name();
    println!(r#"{prog} - cross-process instance coordination for Explorer tab bars

USAGE:
    {prog} [COMMAND] [OPTIONS]

COMMANDS:
    host                Run a demo process hosting simulated windows
        -w, --windows N Number of windows to open (default: 1)
    status              Show configuration, endpoint and elected role
    help                Show this help message
    version             Show version information

HOST INPUT (one command per line on stdin):
    open                Open another window and make it current
    close [N]           Close window N (default: the newest)
    activate N          Make window N current again
    main <action>       Run an action on the main instance (sync)
    main-async <action> Same, without waiting for it to finish
    broadcast <action>  Run an action on every instance in every process
    count               Total instances across all processes
    main?               Is this the main process
    peers               Connected clients (server only)
    quit                Close all windows and exit

ACTIONS:
    open-tab <path>  open-window <path>  close-tab <path>
    refresh-options  sync-groups  refresh-buttons

ENVIRONMENT VARIABLES:
    TABCOORD_PREFIX          Endpoint name prefix
    TABCOORD_SOCKET_DIR      Directory for socket endpoints (non-Windows)
    TABCOORD_OWNER_PID       Pid that owns the coordination window
    TABCOORD_LOG             Log filter (RUST_LOG takes precedence)

CONFIG FILES:
    ~/.tabcoord.conf
    ~/.config/tabcoord/tabcoord.conf
"#, prog = prog);
}

pub fn print_version() {
    let prog = get_program_name();
    println!("{} {}", prog, VERSION);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Host { windows: usize },
    Status,
    Help,
    Version,
}

pub fn parse_args(args: &[String]) -> Result<Command, String> {
    let cmd = args.get(1).map(|s| s.as_str()).unwrap_or("help");
    match cmd {
        "host" => {
            let mut windows = 1;
            let mut i = 2;
            while i < args.len() {
                match args[i].as_str() {
                    "-w" | "--windows" => {
                        let value = args.get(i + 1).ok_or("missing value for --windows")?;
                        windows = value
                            .parse::<usize>()
                            .map_err(|_| format!("invalid window count: {value}"))?;
                        i += 2;
                    }
                    other => return Err(format!("unknown option for host: {other}")),
                }
            }
            Ok(Command::Host { windows })
        }
        "status" => Ok(Command::Status),
        "help" | "-h" | "--help" => Ok(Command::Help),
        "version" | "-V" | "--version" => Ok(Command::Version),
        other => Err(format!("unknown command: {other}")),
    }
}

/// A line typed into `host`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostInput {
    Open,
    Close(Option<usize>),
    Activate(usize),
    Main(Action, ExecMode),
    Broadcast(Action),
    Count,
    IsMain,
    Peers,
    Quit,
}

pub fn parse_action(words: &[&str]) -> Result<Action, String> {
    let path = || {
        if words.len() < 2 {
            Err(format!("{} needs a path", words[0]))
        } else {
            Ok(words[1..].join(" "))
        }
    };
    match words.first().copied() {
        Some("open-tab") => Ok(Action::OpenTab { path: path()?, activate: true }),
        Some("open-window") => Ok(Action::OpenWindow { path: path()? }),
        Some("close-tab") => Ok(Action::CloseTab { path: path()? }),
        Some("refresh-options") => Ok(Action::RefreshOptions),
        Some("sync-groups") => Ok(Action::SyncGroups),
        Some("refresh-buttons") => Ok(Action::RefreshButtons),
        Some(other) => Err(format!("unknown action: {other}")),
        None => Err("missing action".to_string()),
    }
}

pub fn parse_host_input(line: &str) -> Result<HostInput, String> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let index = |w: Option<&&str>| -> Result<usize, String> {
        let w = w.ok_or("missing window number")?;
        w.parse::<usize>().map_err(|_| format!("invalid window number: {w}"))
    };
    match words.first().copied() {
        Some("open") => Ok(HostInput::Open),
        Some("close") => match words.get(1) {
            None => Ok(HostInput::Close(None)),
            some => Ok(HostInput::Close(Some(index(some)?))),
        },
        Some("activate") => Ok(HostInput::Activate(index(words.get(1))?)),
        Some("main") => Ok(HostInput::Main(parse_action(&words[1..])?, ExecMode::Sync)),
        Some("main-async") => Ok(HostInput::Main(parse_action(&words[1..])?, ExecMode::Async)),
        Some("broadcast") => Ok(HostInput::Broadcast(parse_action(&words[1..])?)),
        Some("count") => Ok(HostInput::Count),
        Some("main?") => Ok(HostInput::IsMain),
        Some("peers") => Ok(HostInput::Peers),
        Some("quit") | Some("exit") => Ok(HostInput::Quit),
        Some(other) => Err(format!("unknown input: {other}")),
        None => Err("empty input".to_string()),
    }
}
