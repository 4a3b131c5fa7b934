use std::process::ExitCode;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{self, Receiver};
use tokio_util::sync::CancellationToken;

use config_file::InputSettings;
use events::LogEvent;
use input::DockerInput;

mod cli;
mod config_file;
mod events;
mod input;
mod runtime;
mod signals;
mod sincedb;
#[cfg(test)]
mod testing;

/// Write every event as one JSON line to stdout.
async fn write_events(mut rx: Receiver<LogEvent>) {
    let mut stdout = tokio::io::stdout();
    while let Some(event) = rx.recv().await {
        let mut line = match serde_json::to_vec(&event) {
            Ok(line) => line,
            Err(e) => {
                log::error!("Failed to serialize event: {e}");
                continue;
            }
        };
        line.push(b'\n');
        if let Err(e) = stdout.write_all(&line).await {
            // Dropping the receiver stops the input
            log::error!("Failed to write event to stdout: {e}");
            break;
        }
    }
    let _ = stdout.flush().await;
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize the logger
    env_logger::init();

    let settings = match InputSettings::try_init() {
        Ok(settings) => settings,
        Err(err) => {
            log::error!(
                "Unable to load config {}: {err}",
                cli::get_cli_args().config.display()
            );
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    if let Err(err) = signals::handle_shutdown(cancel.clone()) {
        log::error!("Unable to register signal handlers: {err}");
        return ExitCode::FAILURE;
    }

    let (tx, rx) = mpsc::channel(settings.event_buffer.get());
    let writer = tokio::spawn(write_events(rx));

    let input = match DockerInput::connect(&settings, tx, cancel).await {
        Ok(input) => input,
        Err(err) => {
            log::error!("Unable to start docker input: {err}");
            return ExitCode::FAILURE;
        }
    };

    let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);
    input.run().await;

    // All senders are gone once the input stopped
    if let Err(err) = writer.await {
        log::error!("Event writer panicked: {err}");
        return ExitCode::FAILURE;
    }

    log::info!("Docker input stopped");
    ExitCode::SUCCESS
}
