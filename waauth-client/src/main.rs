use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::Path,
    sync::{Arc, Mutex},
};

use clap::Parser;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::MakeWriter;
use url::Url;
use waauth_client::{
    ChannelObserver, ClientArgs, Notification, Observers, RedirectObserver, Supervisor,
    SupervisorHandle,
    config::{load_client_config, save_config_to_path},
};
use waauth_core::SessionState;

const QR_PREVIEW_CHARS: usize = 48;

#[derive(Clone)]
struct FileMakeWriter {
    file: Arc<Mutex<File>>,
}

struct FileWriterGuard {
    file: Arc<Mutex<File>>,
}

impl Write for FileWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.flush()
    }
}

impl<'a> MakeWriter<'a> for FileMakeWriter {
    type Writer = FileWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        FileWriterGuard {
            file: Arc::clone(&self.file),
        }
    }
}

fn init_logging(log_file: Option<&Path>) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let Some(log_path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(io::stderr)
            .init();
        return;
    };

    let file = match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("failed to open log file {}: {err}", log_path.display());
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(io::stderr)
                .init();
            return;
        }
    };

    let make_writer = FileMakeWriter {
        file: Arc::new(Mutex::new(file)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(false)
        .with_writer(make_writer)
        .init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Input {
    Retry,
    Refresh,
    Restart,
    Logout,
    Destroy,
    Status,
    Quit,
}

fn parse_input(line: &str) -> Option<Input> {
    match line.trim().to_ascii_lowercase().as_str() {
        "retry" => Some(Input::Retry),
        "refresh" => Some(Input::Refresh),
        "restart" => Some(Input::Restart),
        "logout" => Some(Input::Logout),
        "destroy" => Some(Input::Destroy),
        "status" => Some(Input::Status),
        "quit" | "exit" => Some(Input::Quit),
        _ => None,
    }
}

fn describe(state: &SessionState) -> String {
    let mut line = format!(
        "phase={} ready={} attempts={}",
        state.phase, state.client_ready, state.connection_attempts
    );
    if let Some(err) = &state.last_error {
        line.push_str(&format!(" error={err:?}"));
    }
    line
}

fn qr_preview(qr: &str) -> String {
    if qr.chars().count() <= QR_PREVIEW_CHARS {
        return qr.to_owned();
    }
    let head: String = qr.chars().take(QR_PREVIEW_CHARS).collect();
    format!("{head}...")
}

#[tokio::main]
async fn main() {
    let args = ClientArgs::parse();
    init_logging(args.log_file.as_deref());

    let config = match load_client_config(&args) {
        Ok(config) => config,
        Err(err) => {
            error!("invalid configuration: {err}");
            std::process::exit(2);
        }
    };

    if args.save_config {
        match &args.config {
            Some(path) => match save_config_to_path(path, &config.to_saved()) {
                Ok(()) => info!(path = %path.display(), "saved config"),
                Err(err) => warn!(path = %path.display(), "failed to save config: {err}"),
            },
            None => warn!("--save-config needs --config <path>"),
        }
    }

    let mut observers = Observers::new();
    let (channel_observer, notifications) = ChannelObserver::new();
    observers.push(Box::new(channel_observer));

    let redirects = match config.return_to.clone() {
        Some(return_to) => {
            let (redirect_observer, rx) =
                RedirectObserver::new(return_to, config.timings.redirect_delay());
            observers.push(Box::new(redirect_observer));
            rx
        }
        None => mpsc::unbounded_channel().1,
    };

    let (handle, task) = match Supervisor::spawn(config, observers) {
        Ok(spawned) => spawned,
        Err(err) => {
            error!("failed to start supervisor: {err}");
            std::process::exit(1);
        }
    };

    run_console(&handle, notifications, redirects).await;

    if handle.shutdown().is_err() {
        info!("supervisor already stopped");
    }
    if let Err(err) = task.await {
        error!("supervisor task failed: {err}");
    }
}

async fn run_console(
    handle: &SupervisorHandle,
    mut notifications: mpsc::UnboundedReceiver<Notification>,
    mut redirects: mpsc::UnboundedReceiver<Url>,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            notification = notifications.recv() => match notification {
                Some(Notification::Transition { current, .. }) => {
                    println!("{}", describe(&current));
                }
                Some(Notification::QrDisplayed(qr)) => {
                    println!("qr {}", qr_preview(&qr));
                }
                None => break,
            },
            Some(url) = redirects.recv() => {
                println!("redirect {url}");
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let Some(input) = parse_input(&line) else {
                        println!("commands: retry refresh restart logout destroy status quit");
                        continue;
                    };
                    let sent = match input {
                        Input::Retry => handle.retry(),
                        Input::Refresh => handle.refresh(),
                        Input::Restart => handle.restart(),
                        Input::Logout => handle.logout(),
                        Input::Destroy => handle.destroy_session(),
                        Input::Status => {
                            println!("{}", describe(&handle.state()));
                            Ok(())
                        }
                        Input::Quit => break,
                    };
                    if let Err(err) = sent {
                        warn!("{err}");
                        break;
                    }
                }
                Ok(None) => stdin_open = false,
                Err(err) => {
                    warn!("stdin read failed: {err}");
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }
}
