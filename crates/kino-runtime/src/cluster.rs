//! Cluster transport seam for the master/worker work-distribution protocol.
//!
//! The whole protocol is two single-integer messages: a worker sends any
//! value to the master to ask for work, the master replies with a work-item
//! index or [`NO_MORE_WORK`]. Sends and receives block; the source of a
//! received message identifies the requester.

use crossbeam_channel::{unbounded, Receiver, Sender};
use thiserror::Error;

/// Master's reply when the plan is exhausted: drain and exit.
pub const NO_MORE_WORK: i32 = -1;

pub const MASTER_RANK: usize = 0;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport disconnected")]
    Disconnected,
    #[error("no such peer: rank {0}")]
    InvalidPeer(usize),
    #[error("protocol violation: {0}")]
    Protocol(String),
}

pub trait Transport: Send + Sync {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    fn send(&self, dest: usize, value: i32) -> Result<(), TransportError>;
    /// Blocks for the next message from any peer; returns `(source, value)`.
    fn recv_any(&self) -> Result<(usize, i32), TransportError>;
    /// Blocks for the next message, which must come from `source`.
    fn recv_from(&self, source: usize) -> Result<i32, TransportError>;
}

/// Transport for a single-process, single-node job. Any actual message is a
/// protocol violation because there are no peers.
#[derive(Debug, Default)]
pub struct SingleNode;

impl Transport for SingleNode {
    fn rank(&self) -> usize {
        MASTER_RANK
    }

    fn size(&self) -> usize {
        1
    }

    fn send(&self, dest: usize, _value: i32) -> Result<(), TransportError> {
        Err(TransportError::InvalidPeer(dest))
    }

    fn recv_any(&self) -> Result<(usize, i32), TransportError> {
        Err(TransportError::Protocol(
            "recv on a single-node transport".to_string(),
        ))
    }

    fn recv_from(&self, source: usize) -> Result<i32, TransportError> {
        Err(TransportError::InvalidPeer(source))
    }
}

/// In-process mesh of `size` nodes connected by channels; each node's handle
/// is moved onto that node's driver thread. Used by multi-node tests and the
/// demo.
#[derive(Debug)]
pub struct LocalMeshNode {
    rank: usize,
    inbox: Receiver<(usize, i32)>,
    peers: Vec<Sender<(usize, i32)>>,
}

pub fn local_mesh(size: usize) -> Vec<LocalMeshNode> {
    assert!(size >= 1, "mesh must have at least one node");
    let mut inboxes = Vec::with_capacity(size);
    let mut senders = Vec::with_capacity(size);
    for _ in 0..size {
        let (tx, rx) = unbounded();
        senders.push(tx);
        inboxes.push(rx);
    }
    inboxes
        .into_iter()
        .enumerate()
        .map(|(rank, inbox)| LocalMeshNode {
            rank,
            inbox,
            peers: senders.clone(),
        })
        .collect()
}

impl Transport for LocalMeshNode {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, dest: usize, value: i32) -> Result<(), TransportError> {
        let peer = self
            .peers
            .get(dest)
            .ok_or(TransportError::InvalidPeer(dest))?;
        peer.send((self.rank, value))
            .map_err(|_| TransportError::Disconnected)
    }

    fn recv_any(&self) -> Result<(usize, i32), TransportError> {
        self.inbox.recv().map_err(|_| TransportError::Disconnected)
    }

    fn recv_from(&self, source: usize) -> Result<i32, TransportError> {
        let (from, value) = self.recv_any()?;
        if from != source {
            return Err(TransportError::Protocol(format!(
                "expected message from rank {source}, got one from rank {from}"
            )));
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mesh_request_reply() {
        let mut nodes = local_mesh(2);
        let worker = nodes.pop().expect("worker");
        let master = nodes.pop().expect("master");

        let worker_thread = std::thread::spawn(move || {
            worker.send(MASTER_RANK, 1).expect("request");
            worker.recv_from(MASTER_RANK).expect("reply")
        });

        let (source, value) = master.recv_any().expect("request");
        assert_eq!(source, 1);
        assert_eq!(value, 1);
        master.send(source, 42).expect("reply");

        assert_eq!(worker_thread.join().expect("join"), 42);
    }

    #[test]
    fn single_node_rejects_messaging() {
        let t = SingleNode;
        assert_eq!(t.size(), 1);
        assert!(t.send(1, 0).is_err());
        assert!(t.recv_any().is_err());
    }
}
