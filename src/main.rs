use std::env;
use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use tabcoord::cli::{parse_args, parse_host_input, print_help, print_version, Command, HostInput};
use tabcoord::config::{load_config, CoordConfig};
use tabcoord::demo::{AppliedLog, WindowThread};
use tabcoord::logging::init_logging;
use tabcoord::platform::default_owner_query;
use tabcoord::transport::Endpoint;
use tabcoord::{elect, InstanceManager, WindowHandle, WindowOwnerQuery};

fn main() -> io::Result<()> {
    let args: Vec<String> = env::args().collect();
    let command = match parse_args(&args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            eprintln!("Run '{} help' for usage.", tabcoord::cli::get_program_name());
            std::process::exit(1);
        }
    };

    match command {
        Command::Help => print_help(),
        Command::Version => print_version(),
        Command::Status => {
            let config = load_config();
            init_logging(&config.log_filter);
            print_status(&config);
        }
        Command::Host { windows } => {
            let config = load_config();
            init_logging(&config.log_filter);
            run_host(config, windows)?;
        }
    }
    Ok(())
}

fn print_status(config: &CoordConfig) {
    let pid = std::process::id();
    let owner = default_owner_query(config).coordination_window_owner();
    println!("pid:             {pid}");
    println!("endpoint prefix: {}", config.endpoint_prefix);
    #[cfg(unix)]
    println!("socket dir:      {}", config.socket_dir.display());
    println!("window class:    {}", config.window_class);
    match owner {
        Some(owner) => {
            println!("window owner:    {owner}");
            println!("endpoint:        {}", Endpoint::for_owner(config, owner).address());
        }
        None => println!("window owner:    (not found)"),
    }
    match elect(owner, pid) {
        Some(role) => println!("role:            {role}"),
        None => println!("role:            undecided"),
    }
}

/// Window handles for the demo: unique per process and per window.
fn demo_handle(pid: u32, n: usize) -> WindowHandle {
    WindowHandle(((pid as u64) << 16) | (n as u64 & 0xffff))
}

fn run_host(config: CoordConfig, windows: usize) -> io::Result<()> {
    let pid = std::process::id();
    let manager = Arc::new(InstanceManager::start(config));
    info!(pid, role = ?manager.role(), "host started");

    let log: AppliedLog = Arc::new(Mutex::new(Vec::new()));
    let mut open: Vec<(usize, WindowThread)> = Vec::new();
    let mut opened = 0usize;
    let mut open_window = |open: &mut Vec<(usize, WindowThread)>| -> io::Result<()> {
        opened += 1;
        let window = WindowThread::open(manager.clone(), demo_handle(pid, opened), log.clone())?;
        println!("window {opened} open as {}", window.handle());
        open.push((opened, window));
        Ok(())
    };
    for _ in 0..windows {
        open_window(&mut open)?;
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    print!("> ");
    stdout.flush()?;
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            print!("> ");
            stdout.flush()?;
            continue;
        }
        match parse_host_input(&line) {
            Ok(HostInput::Quit) => break,
            Ok(HostInput::Open) => open_window(&mut open)?,
            Ok(HostInput::Close(n)) => {
                let pos = match n {
                    Some(n) => open.iter().position(|(i, _)| *i == n),
                    None => open.len().checked_sub(1),
                };
                match pos {
                    Some(pos) => {
                        let (n, window) = open.remove(pos);
                        window.close();
                        println!("window {n} closed");
                    }
                    None => println!("no such window"),
                }
            }
            Ok(HostInput::Activate(n)) => match open.iter().find(|(i, _)| *i == n) {
                Some((_, window)) => {
                    let mgr = manager.clone();
                    let done = window.exec(move || mgr.activate_tab_bar());
                    println!("activated: {}", done.unwrap_or(false));
                }
                None => println!("no such window"),
            },
            Ok(HostInput::Main(action, mode)) => {
                // Issued from the newest window, like a key press would be.
                let mgr = manager.clone();
                let run = move || mgr.run_on_main_instance(action, mode);
                match open.last() {
                    Some((_, window)) => {
                        let _ = window.exec(run);
                    }
                    None => run(),
                }
            }
            Ok(HostInput::Broadcast(action)) => {
                let mgr = manager.clone();
                let run = move || mgr.broadcast_to_all_instances(action, true);
                match open.last() {
                    Some((_, window)) => {
                        let _ = window.exec(run);
                    }
                    None => run(),
                }
            }
            Ok(HostInput::Count) => println!("{}", manager.total_instance_count()),
            Ok(HostInput::IsMain) => println!("{}", manager.is_this_the_main_process()),
            Ok(HostInput::Peers) => match manager.coordinator().server() {
                Some(server) => {
                    for peer in server.peers() {
                        let since = peer.connected_at.format("%H:%M:%S");
                        println!("{}  pid {}  since {since}", peer.id, peer.pid);
                    }
                }
                None => println!("not the server"),
            },
            Err(e) => warn!(input = %line.trim(), error = %e, "ignored"),
        }
        print!("> ");
        stdout.flush()?;
    }

    for (_, window) in open.drain(..) {
        window.close();
    }
    manager.shutdown();
    info!(pid, "host stopped");
    Ok(())
}
