use std::{future::Future, net::SocketAddr, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{debug, warn};

use crate::{endpoint::Endpoint, error::TransportError};

/// Pause after a failed accept so a persistent error (e.g. fd exhaustion)
/// does not spin the loop.
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(50);

/// Accepts inbound sockets and hands each one to a caller-supplied factory.
pub struct Acceptor {
    listener: TcpListener,
}

impl Acceptor {
    pub async fn bind(endpoint: Endpoint) -> Result<Self, TransportError> {
        let addr = endpoint.socket_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;
        Ok(Self::new(listener))
    }

    pub fn new(listener: TcpListener) -> Self {
        Self { listener }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts forever. A failed accept is logged and never ends the loop.
    pub async fn run<F>(self, on_accept: F)
    where
        F: FnMut(TcpStream, SocketAddr),
    {
        self.run_until(std::future::pending(), on_accept).await;
    }

    /// Accepts until `shutdown` resolves, then drops the listener.
    pub async fn run_until<S, F>(self, shutdown: S, mut on_accept: F)
    where
        S: Future<Output = ()>,
        F: FnMut(TcpStream, SocketAddr),
    {
        let Acceptor { listener } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    debug!("acceptor shutting down");
                    break;
                }
                accept_result = listener.accept() => match accept_result {
                    Ok((stream, peer)) => on_accept(stream, peer),
                    Err(err) => {
                        warn!(error = ?err, "failed to accept connection");
                        tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{sync::mpsc, time::timeout};

    use super::*;

    #[tokio::test]
    async fn hands_every_socket_to_the_factory() {
        let acceptor = Acceptor::bind("127.0.0.1:0".parse().expect("endpoint"))
            .await
            .expect("bind");
        let addr = acceptor.local_addr().expect("local addr");

        let (accepted_tx, mut accepted_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(acceptor.run_until(
            async move {
                let _ = stop_rx.await;
            },
            move |stream, peer| {
                let _ = accepted_tx.send((stream, peer));
            },
        ));

        let first = TcpStream::connect(addr).await.expect("first dial");
        let second = TcpStream::connect(addr).await.expect("second dial");

        let mut peers = Vec::new();
        for _ in 0..2 {
            let (_stream, peer) = timeout(Duration::from_secs(1), accepted_rx.recv())
                .await
                .expect("accept before timeout")
                .expect("accepted socket");
            peers.push(peer);
        }
        peers.sort();
        let mut expected = vec![
            first.local_addr().expect("first addr"),
            second.local_addr().expect("second addr"),
        ];
        expected.sort();
        assert_eq!(peers, expected);

        let _ = stop_tx.send(());
        server.await.expect("acceptor task");
    }

    #[tokio::test]
    async fn bind_failure_names_the_address() {
        let taken = Acceptor::bind("127.0.0.1:0".parse().expect("endpoint"))
            .await
            .expect("bind");
        let addr = taken.local_addr().expect("local addr");

        match Acceptor::bind(addr.into()).await {
            Err(TransportError::Bind { addr: failed, .. }) => assert_eq!(failed, addr),
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("second bind on {addr} should fail"),
        }
    }
}
