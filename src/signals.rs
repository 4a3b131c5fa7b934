use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use tokio_util::sync::CancellationToken;

/// Stop the input on SIGINT/SIGTERM.
///
/// The first signal tells systemd we are stopping and cancels `cancel`, so
/// tailers stop and the sincedb gets its final write. A second signal exits
/// right away.
pub fn handle_shutdown(cancel: CancellationToken) -> std::io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;

    std::thread::spawn(move || {
        for signal in signals.forever() {
            if cancel.is_cancelled() {
                log::warn!("Received signal {signal} during shutdown, exiting now");
                std::process::exit(1);
            }
            log::info!("Received signal {signal}, shutting down");
            let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Stopping]);
            cancel.cancel();
        }
    });

    Ok(())
}
