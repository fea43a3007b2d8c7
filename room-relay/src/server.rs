use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream, tcp::OwnedWriteHalf},
    select,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    protocol::{Inbound, read_inbound, write_event},
    relay::Relay,
    session::{ConnectionId, Inbox, OUTBOX_CAPACITY, Session, outbox},
};

pub struct Server {
    listener: TcpListener,
    relay: Arc<Relay>,
}

impl Server {
    pub fn new(listener: TcpListener, relay: Arc<Relay>) -> Self {
        Self { listener, relay }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, relay } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("relay shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &relay);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(result: std::io::Result<(TcpStream, SocketAddr)>, relay: &Arc<Relay>) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, relay),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(stream: TcpStream, peer: SocketAddr, relay: &Arc<Relay>) {
    let relay = Arc::clone(relay);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, peer, relay).await {
            warn!(peer = %peer, error = ?err, "connection closed with error");
        }
    });
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, relay: Arc<Relay>) -> Result<()> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let (tx, inbox) = outbox(OUTBOX_CAPACITY);
    let mut session = relay.open_session(tx);
    let conn = session.id();
    info!(%conn, %peer, "connection opened");

    let mut writer_task = tokio::spawn(drain_outbox(inbox, writer, conn));
    let result = run_session(&relay, &mut session, &mut reader, &mut writer_task).await;

    // Teardown also drops every clone of the outbox, which lets the writer
    // flush what is queued and stop.
    relay.disconnect(session).await;
    if !writer_task.is_finished() {
        if let Err(err) = writer_task.await {
            debug!(%conn, error = ?err, "writer task ended abnormally");
        }
    }

    info!(%conn, %peer, "connection closed");
    result
}

async fn run_session<R>(
    relay: &Relay,
    session: &mut Session,
    reader: &mut R,
    writer_task: &mut JoinHandle<()>,
) -> Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    loop {
        select! {
            inbound = read_inbound(reader) => {
                match inbound.context("failed to read event")? {
                    // Runs to completion even if the peer hangs up meanwhile.
                    Some(Inbound::Event(event)) => {
                        let _ = relay.dispatch(session, event).await;
                    }
                    Some(Inbound::Unrecognized(err)) => {
                        debug!(conn = %session.id(), error = %err, "skipping unrecognized event");
                    }
                    None => return Ok(()),
                }
            }
            _ = &mut *writer_task => {
                debug!(conn = %session.id(), "writer stopped; closing session");
                return Ok(());
            }
        }
    }
}

async fn drain_outbox(mut inbox: Inbox, mut writer: OwnedWriteHalf, conn: ConnectionId) {
    while let Some(event) = inbox.recv().await {
        if let Err(err) = write_event(&mut writer, &event).await {
            debug!(%conn, ?err, "failed to deliver event to client");
            return;
        }
    }
    if inbox.overflowed() {
        warn!(%conn, capacity = OUTBOX_CAPACITY, "client stopped reading; closing connection");
    }

    if let Err(err) = writer.shutdown().await {
        debug!(%conn, ?err, "failed to shut down writer cleanly");
    }
}
