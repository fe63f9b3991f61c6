use std::io::ErrorKind;
use std::net::TcpListener;

use anyhow::anyhow;
use dialoguer::Confirm;
use tokio::task;

/// Outcome of a successful negotiation: the port and the already-bound
/// listener, handed to the HTTP server as-is so nothing can steal the port
/// between negotiation and startup.
#[derive(Debug)]
pub struct NegotiatedPort {
    pub listener: TcpListener,
    pub port: u16,
}

/// Resolves a concrete listening port. Returns `None` when the user declines
/// the offered alternate, which aborts startup silently. A non-interactive
/// session never prompts: an occupied port is an error.
pub async fn negotiate(
    host: &str,
    desired_port: u16,
    interactive: bool,
) -> anyhow::Result<Option<NegotiatedPort>> {
    match try_bind(host, desired_port) {
        Ok(listener) => Ok(Some(NegotiatedPort {
            listener,
            port: desired_port,
        })),
        Err(error) if error.kind() == ErrorKind::AddrInUse => {
            if !interactive {
                anyhow::bail!("Something is already running on port {desired_port}.");
            }
            let (listener, port) = next_free_port(host, desired_port)?;
            if confirm_alternate(desired_port, port).await? {
                Ok(Some(NegotiatedPort { listener, port }))
            } else {
                Ok(None)
            }
        }
        Err(error) => Err(anyhow::Error::from(error)
            .context(format!("failed to bind to {host}:{desired_port}"))),
    }
}

fn try_bind(host: &str, port: u16) -> std::io::Result<TcpListener> {
    TcpListener::bind((host, port))
}

fn next_free_port(host: &str, occupied: u16) -> anyhow::Result<(TcpListener, u16)> {
    let mut port = occupied;

    loop {
        port = port.checked_add(1).ok_or_else(|| {
            anyhow!("failed to find an available port starting at {occupied}")
        })?;

        match try_bind(host, port) {
            Ok(listener) => return Ok((listener, port)),
            Err(error) if error.kind() == ErrorKind::AddrInUse => continue,
            Err(error) => {
                return Err(
                    anyhow::Error::from(error).context(format!("failed to bind to {host}:{port}"))
                );
            }
        }
    }
}

async fn confirm_alternate(desired: u16, offered: u16) -> anyhow::Result<bool> {
    let prompt = format!(
        "Something is already running on port {desired}. Would you like to run the app on port {offered} instead?"
    );
    let accepted = task::spawn_blocking(move || {
        Confirm::new().with_prompt(prompt).default(true).interact()
    })
    .await??;
    Ok(accepted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn free_port_is_bound_directly() {
        // Grab an ephemeral port, release it, then negotiate for it.
        let probe = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let negotiated = negotiate("127.0.0.1", port, false).await.unwrap().unwrap();
        assert_eq!(negotiated.port, port);
        assert_eq!(negotiated.listener.local_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn occupied_port_fails_without_prompting_when_non_interactive() {
        let holder = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = holder.local_addr().unwrap().port();

        let error = negotiate("127.0.0.1", port, false).await.unwrap_err();
        assert!(
            error
                .to_string()
                .contains(&format!("already running on port {port}"))
        );
    }

    #[test]
    fn next_free_port_skips_the_occupied_one() {
        let holder = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let occupied = holder.local_addr().unwrap().port();

        if occupied == u16::MAX {
            return;
        }
        let (listener, port) = next_free_port("127.0.0.1", occupied).unwrap();
        assert!(port > occupied);
        assert_eq!(listener.local_addr().unwrap().port(), port);
    }
}
