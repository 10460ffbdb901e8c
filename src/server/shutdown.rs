use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Paired handle and signal for stopping the peer RPC server. The server stops when the handle is
/// used or dropped, so a node that goes away takes its listener with it.
pub(crate) fn shutdown_signal() -> (RpcServerShutdownHandle, RpcServerShutdownSignal) {
    let (tx, rx) = oneshot::channel();

    (RpcServerShutdownHandle { tx: Some(tx) }, RpcServerShutdownSignal { rx })
}

pub(crate) struct RpcServerShutdownHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl RpcServerShutdownHandle {
    pub(crate) fn shutdown(&mut self) {
        if let Some(tx) = self.tx.take() {
            // Receiver is gone if the server already exited.
            let _ = tx.send(());
        }
    }
}

pub(crate) struct RpcServerShutdownSignal {
    rx: oneshot::Receiver<()>,
}

impl Future for RpcServerShutdownSignal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Sent or dropped, either way we stop.
        Pin::new(&mut self.rx).poll(cx).map(|_| ())
    }
}
