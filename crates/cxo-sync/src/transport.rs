//! Message pipes between peers.
//!
//! A connection task only sees a [`Wire`]: a bounded outgoing queue and an
//! incoming stream of decoded messages. In-process peers are joined with
//! [`local_pair`]; TCP streams are adapted by [`tcp_wire`], which runs one
//! reader and one writer task per socket.

use cxo_protocol::{Msg, MsgCodec};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Both directions of one connection.
#[derive(Debug)]
pub struct Wire {
    pub tx: mpsc::Sender<Msg>,
    pub rx: mpsc::Receiver<Msg>,
    /// Human-readable peer address.
    pub remote: String,
}

/// Two connected in-process wires.
pub fn local_pair(capacity: usize) -> (Wire, Wire) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    (
        Wire {
            tx: a_tx,
            rx: a_rx,
            remote: "local".into(),
        },
        Wire {
            tx: b_tx,
            rx: b_rx,
            remote: "local".into(),
        },
    )
}

/// Adapt a TCP stream. The socket is closed once the returned wire is
/// dropped.
pub fn tcp_wire(stream: TcpStream, codec: MsgCodec, capacity: usize) -> Wire {
    let remote = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "tcp".into());
    let (mut reader, mut writer) = stream.into_split();
    let (in_tx, in_rx) = mpsc::channel::<Msg>(capacity);
    let (out_tx, mut out_rx) = mpsc::channel::<Msg>(capacity);

    let peer = remote.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = in_tx.closed() => break,
                read = codec.read(&mut reader) => match read {
                    Ok(Some(msg)) => {
                        if in_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "tcp read failed");
                        break;
                    }
                },
            }
        }
        debug!(peer = %peer, "tcp reader done");
    });

    let peer = remote.clone();
    tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if let Err(e) = codec.write(&mut writer, &msg).await {
                warn!(peer = %peer, error = %e, "tcp write failed");
                break;
            }
        }
        let _ = writer.shutdown().await;
        debug!(peer = %peer, "tcp writer done");
    });

    Wire {
        tx: out_tx,
        rx: in_rx,
        remote,
    }
}
