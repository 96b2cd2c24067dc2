//! Dedicated-connection LISTEN with reconnection.
//!
//! Each [`spawn_listener`] call owns one connection that carries no query
//! traffic. If the connection dies the task reports the error and
//! reconnects with exponential backoff, re-issuing the `LISTEN` so
//! delivery resumes on the same callback.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_postgres::{AsyncMessage, Client, NoTls};

use crate::error::Error;
use crate::values::escape_ident;

/// Callback invoked with each notification payload.
pub type NotifyCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Callback invoked when the listening connection fails.
pub type ErrorCallback = Arc<dyn Fn(Error) + Send + Sync>;

/// Handle to an active `LISTEN`. Call [`ListenGuard::unlisten`] for an
/// orderly shutdown; dropping the guard stops the listener without
/// waiting for the `UNLISTEN` round-trip.
pub struct ListenGuard {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl std::fmt::Debug for ListenGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenGuard").finish()
    }
}

impl ListenGuard {
    /// Cancels any pending reconnection, issues `UNLISTEN` (errors
    /// swallowed) and releases the connection.
    pub async fn unlisten(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ListenGuard {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// Reconnection delay before attempt `n`.
fn backoff_delay(attempt: u32) -> Duration {
    let factor = 1u64 << attempt.min(15);
    Duration::from_millis(1000u64.saturating_mul(factor).min(30_000))
}

fn listen_error(channel: &str, source: Error) -> Error {
    Error::Listen {
        channel: channel.to_owned(),
        source: Box::new(source),
    }
}

/// Opens a connection whose async messages are forwarded on a channel.
/// The forwarding task ends when the connection does.
async fn connect_raw(
    url: &str,
) -> Result<
    (
        Client,
        mpsc::UnboundedReceiver<Result<AsyncMessage, tokio_postgres::Error>>,
    ),
    Error,
> {
    let (client, mut connection) = tokio_postgres::connect(url, NoTls).await.map_err(Error::Db)?;
    let (tx, rx) = mpsc::unbounded_channel();
    drop(tokio::spawn(async move {
        let mut messages = stream::poll_fn(move |cx| connection.poll_message(cx));
        while let Some(message) = messages.next().await {
            let failed = message.is_err();
            if tx.send(message).is_err() || failed {
                break;
            }
        }
    }));
    Ok((client, rx))
}

/// Starts listening on `channel` over a dedicated connection. The first
/// connection and `LISTEN` happen eagerly so initial failures surface to
/// the caller; later failures go to `on_error` followed by reconnection.
pub(crate) async fn spawn_listener(
    url: String,
    channel: String,
    on_notify: NotifyCallback,
    on_error: ErrorCallback,
) -> Result<ListenGuard, Error> {
    let listen_sql = format!("LISTEN \"{}\"", escape_ident(&channel));
    let (client, rx) = match connect_raw(&url).await {
        Ok(conn) => conn,
        Err(e) => return Err(listen_error(&channel, e)),
    };
    if let Err(e) = client.batch_execute(&listen_sql).await {
        return Err(listen_error(&channel, Error::Db(e)));
    }

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(listener_task(ListenerTask {
        url,
        channel,
        listen_sql,
        client,
        rx,
        on_notify,
        on_error,
        shutdown: shutdown_rx,
    }));
    Ok(ListenGuard {
        shutdown: Some(shutdown_tx),
        task: Some(task),
    })
}

struct ListenerTask {
    url: String,
    channel: String,
    listen_sql: String,
    client: Client,
    rx: mpsc::UnboundedReceiver<Result<AsyncMessage, tokio_postgres::Error>>,
    on_notify: NotifyCallback,
    on_error: ErrorCallback,
    shutdown: oneshot::Receiver<()>,
}

async fn listener_task(mut state: ListenerTask) {
    let mut attempt: u32 = 0;
    'connected: loop {
        loop {
            tokio::select! {
                _ = &mut state.shutdown => break 'connected,
                message = state.rx.recv() => match message {
                    Some(Ok(AsyncMessage::Notification(n))) => {
                        if n.channel() == state.channel {
                            (state.on_notify)(n.payload().to_owned());
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        (state.on_error)(listen_error(&state.channel, Error::Db(e)));
                        break;
                    }
                    None => {
                        (state.on_error)(listen_error(
                            &state.channel,
                            Error::Configuration("listen connection closed".to_owned()),
                        ));
                        break;
                    }
                }
            }
        }

        // Reconnect with exponential backoff, preserving listener state.
        loop {
            let delay = backoff_delay(attempt);
            attempt = attempt.saturating_add(1);
            tokio::select! {
                _ = &mut state.shutdown => break 'connected,
                _ = tokio::time::sleep(delay) => {}
            }
            match connect_raw(&state.url).await {
                Ok((client, rx)) => match client.batch_execute(&state.listen_sql).await {
                    Ok(()) => {
                        state.client = client;
                        state.rx = rx;
                        attempt = 0;
                        continue 'connected;
                    }
                    Err(e) => (state.on_error)(listen_error(&state.channel, Error::Db(e))),
                },
                Err(e) => (state.on_error)(listen_error(&state.channel, e)),
            }
        }
    }

    let unlisten_sql = format!("UNLISTEN \"{}\"", escape_ident(&state.channel));
    let _ = state.client.batch_execute(&unlisten_sql).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(0), Duration::from_millis(1000));
        assert_eq!(backoff_delay(1), Duration::from_millis(2000));
        assert_eq!(backoff_delay(4), Duration::from_millis(16_000));
        assert_eq!(backoff_delay(5), Duration::from_millis(30_000));
        assert_eq!(backoff_delay(40), Duration::from_millis(30_000));
    }

    #[test]
    fn listen_error_carries_channel() {
        let err = listen_error("chat", Error::Configuration("nope".into()));
        match err {
            Error::Listen { channel, .. } => assert_eq!(channel, "chat"),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
