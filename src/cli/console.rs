use std::io::BufRead;
use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::core::orchestrator::{CommandError, ControlCommand};

/// Read operator commands line by line from `reader` on a dedicated thread.
///
/// Blank lines are ignored and unparseable ones are logged. The thread exits
/// at end of input or once the control loop drops its receiver.
pub fn spawn_console<R>(reader: R, tx: mpsc::Sender<ControlCommand>) -> std::io::Result<JoinHandle<()>>
where
    R: BufRead + Send + 'static,
{
    std::thread::Builder::new()
        .name("console".to_string())
        .spawn(move || {
            for line in reader.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "Console read failed");
                        break;
                    }
                };

                match line.parse::<ControlCommand>() {
                    Ok(command) => {
                        if tx.blocking_send(command).is_err() {
                            break;
                        }
                    }
                    Err(CommandError::Empty) => {}
                    Err(e) => warn!(input = %line.trim(), "{}", e),
                }
            }
            debug!("Console input closed");
        })
}
