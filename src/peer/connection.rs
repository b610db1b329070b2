use std::collections::hash_map::Entry;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::framing::{write_frame, write_message};
use crate::message::{DataMessage, Message};
use crate::queue::MessageQueue;

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PeerClass {
    /// exchanges data messages, routed by rules and sticky names
    Message,
    /// exchanges datagrams, routed by source address affinity
    Datagram,
}

/// Per-socket state of a connected peer, shared by the connection's receiver and sender tasks
///  and by the routing table.
pub struct PeerConnection {
    id: u64,
    class: PeerClass,
    addr: SocketAddr,
    connected_at: Instant,
    alive: AtomicBool,
    died: Notify,
    routable: AtomicBool,
    load: AtomicI64,
    outgoing: MessageQueue<Message>,
    pending: PendingAcks,
    writer: Mutex<BufWriter<BoxedWriter>>,
}

impl Debug for PeerConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerConnection{{{}:{:?}@{}}}", self.id, self.class, self.addr)
    }
}

impl PeerConnection {
    pub fn new(class: PeerClass, addr: SocketAddr, writer: BoxedWriter, max_pending_acks: usize) -> PeerConnection {
        PeerConnection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            class,
            addr,
            connected_at: Instant::now(),
            alive: AtomicBool::new(true),
            died: Notify::new(),
            routable: AtomicBool::new(false),
            load: AtomicI64::new(0),
            outgoing: MessageQueue::new(),
            pending: PendingAcks::new(max_pending_acks),
            writer: Mutex::new(BufWriter::new(writer)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn class(&self) -> PeerClass {
        self.class
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn uptime(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Flips the connection to dead. This only marks the connection, cleanup is done by the
    ///  connection's own tasks. Returns true for the call that actually changed the state.
    pub fn mark_dead(&self) -> bool {
        let was_alive = self.alive.swap(false, Ordering::AcqRel);
        if was_alive {
            debug!("connection {} to {} is dead", self.id, self.addr);
            self.died.notify_waiters();
        }
        was_alive
    }

    /// Returns once the connection is marked dead
    pub async fn wait_dead(&self) {
        let notified = self.died.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_alive() {
            notified.await;
        }
    }

    /// A peer becomes routable once it sent a message or identified itself
    pub fn is_routable(&self) -> bool {
        self.routable.load(Ordering::Acquire)
    }

    pub fn set_routable(&self, routable: bool) {
        self.routable.store(routable, Ordering::Release);
    }

    pub fn load(&self) -> i64 {
        self.load.load(Ordering::Acquire)
    }

    pub fn set_load(&self, load: i64) {
        self.load.store(load, Ordering::Release);
    }

    pub fn increment_load(&self) {
        self.load.fetch_add(1, Ordering::AcqRel);
    }

    pub fn outgoing(&self) -> &MessageQueue<Message> {
        &self.outgoing
    }

    pub fn pending(&self) -> &PendingAcks {
        &self.pending
    }

    /// Appends a data message to the outgoing queue, handing it back if the queue was closed
    pub async fn enqueue_data(&self, msg: DataMessage) -> Result<(), DataMessage> {
        self.outgoing.push(Message::Data(msg)).await
            .map_err(|msg| match msg {
                Message::Data(data) => data,
                _ => unreachable!("the queue hands back the message that was pushed"),
            })
    }

    /// the number of messages waiting to be sent plus those waiting for an acknowledgment
    pub async fn queue_depth(&self) -> usize {
        self.outgoing.len().await + self.pending.len().await
    }

    /// Writes and flushes a serialized message
    pub async fn send_frame(&self, payload: &[u8]) -> anyhow::Result<()> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, payload).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Writes and flushes a message
    pub async fn send_message(&self, msg: &Message) -> anyhow::Result<()> {
        let mut writer = self.writer.lock().await;
        write_message(&mut *writer, msg).await?;
        writer.flush().await?;
        Ok(())
    }
}


#[derive(Debug)]
pub enum PendingInsert {
    Recorded,
    /// a message with the same id is already waiting for its acknowledgment
    AlreadyPending(DataMessage),
    /// the connection is being torn down
    Closed(DataMessage),
}

/// Messages sent to a peer that were not acknowledged yet, keyed by message id.
///
/// The table's capacity is bounded: [PendingAcks::record_sent] waits while the table is full,
///  which is what keeps a slow peer from accumulating an unbounded number of in-flight messages.
///  Every entry holds one permit of the capacity semaphore, and removing the entry returns it.
pub struct PendingAcks {
    entries: Mutex<FxHashMap<Uuid, DataMessage>>,
    capacity: Semaphore,
}

impl PendingAcks {
    pub fn new(max_pending: usize) -> PendingAcks {
        PendingAcks {
            entries: Default::default(),
            capacity: Semaphore::new(max_pending),
        }
    }

    pub async fn record_sent(&self, msg: DataMessage) -> PendingInsert {
        let permit = match self.capacity.acquire().await {
            Ok(permit) => permit,
            Err(_) => return PendingInsert::Closed(msg),
        };

        match self.entries.lock().await.entry(msg.id) {
            Entry::Occupied(_) => {
                warn!("message {} is already waiting for an acknowledgment", msg.id);
                PendingInsert::AlreadyPending(msg)
            }
            Entry::Vacant(e) => {
                // the permit stays taken until the entry is removed
                permit.forget();
                e.insert(msg);
                PendingInsert::Recorded
            }
        }
    }

    /// Removes and returns the message with the given id, or `None` if no such message is pending
    pub async fn record_ack(&self, id: &Uuid) -> Option<DataMessage> {
        let removed = self.entries.lock().await
            .remove(id);
        if removed.is_some() {
            self.capacity.add_permits(1);
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await
            .len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Closes the capacity gate: a sender waiting in [PendingAcks::record_sent] gets its message
    ///  back, and so does every later call
    pub fn close(&self) {
        self.capacity.close();
    }

    pub async fn drain(&self) -> Vec<DataMessage> {
        self.entries.lock().await
            .drain()
            .map(|(_, msg)| msg)
            .collect()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use tokio::time::timeout;

    use super::*;

    fn test_connection(class: PeerClass) -> PeerConnection {
        PeerConnection::new(class, SocketAddr::from(([127, 0, 0, 1], 9000)), Box::new(tokio::io::sink()), 10)
    }

    #[test]
    fn test_new_connection() {
        let a = test_connection(PeerClass::Message);
        let b = test_connection(PeerClass::Datagram);

        assert!(b.id() > a.id());
        assert!(a.is_alive());
        assert!(!a.is_routable());
        assert_eq!(a.load(), 0);
        assert_eq!(b.class(), PeerClass::Datagram);
    }

    #[test]
    fn test_mark_dead_is_idempotent() {
        let conn = test_connection(PeerClass::Message);
        assert!(conn.mark_dead());
        assert!(!conn.mark_dead());
        assert!(!conn.is_alive());
    }

    #[tokio::test]
    async fn test_wait_dead() {
        let conn = Arc::new(test_connection(PeerClass::Message));
        let waiter = tokio::spawn({
            let conn = conn.clone();
            async move { conn.wait_dead().await }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        conn.mark_dead();
        timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
        // returns right away for a connection that is dead already
        timeout(Duration::from_secs(5), conn.wait_dead()).await.unwrap();
    }

    #[tokio::test]
    async fn test_queue_depth() {
        let conn = test_connection(PeerClass::Message);
        conn.enqueue_data(DataMessage::new("a", "1", "")).await.unwrap();
        conn.enqueue_data(DataMessage::new("a", "2", "")).await.unwrap();
        assert!(matches!(conn.pending().record_sent(DataMessage::new("a", "3", "")).await, PendingInsert::Recorded));

        assert_eq!(conn.queue_depth().await, 3);

        conn.outgoing().close().await;
        let rejected = DataMessage::new("a", "4", "");
        assert_eq!(conn.enqueue_data(rejected.clone()).await, Err(rejected));
    }

    #[tokio::test]
    async fn test_pending_ack_round_trip() {
        let pending = PendingAcks::new(5);
        let msg = DataMessage::new("a", "700", "x");
        let id = msg.id;

        assert!(matches!(pending.record_sent(msg.clone()).await, PendingInsert::Recorded));
        assert_eq!(pending.len().await, 1);

        assert_eq!(pending.record_ack(&id).await, Some(msg));
        assert!(pending.is_empty().await);
        assert_eq!(pending.record_ack(&id).await, None);
    }

    #[tokio::test]
    async fn test_pending_id_at_most_once() {
        let pending = PendingAcks::new(5);
        let msg = DataMessage::new("a", "700", "x");

        assert!(matches!(pending.record_sent(msg.clone()).await, PendingInsert::Recorded));
        match pending.record_sent(msg.clone()).await {
            PendingInsert::AlreadyPending(m) => assert_eq!(m, msg),
            other => panic!("expected AlreadyPending, was {:?}", other),
        }
        assert_eq!(pending.len().await, 1);

        // the rejected duplicate did not use up capacity
        pending.record_ack(&msg.id).await.unwrap();
        for i in 0..5 {
            assert!(matches!(pending.record_sent(DataMessage::new("a", i.to_string(), "")).await, PendingInsert::Recorded));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_sent_blocks_at_capacity() {
        let pending = Arc::new(PendingAcks::new(2));
        let first = DataMessage::new("a", "1", "");
        pending.record_sent(first.clone()).await;
        pending.record_sent(DataMessage::new("a", "2", "")).await;

        let blocked = {
            let pending = pending.clone();
            tokio::spawn(async move { pending.record_sent(DataMessage::new("a", "3", "")).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!blocked.is_finished());

        pending.record_ack(&first.id).await.unwrap();
        let result = timeout(Duration::from_secs(1), blocked).await.unwrap().unwrap();
        assert!(matches!(result, PendingInsert::Recorded));
        assert_eq!(pending.len().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_releases_blocked_sender() {
        let pending = Arc::new(PendingAcks::new(1));
        pending.record_sent(DataMessage::new("a", "1", "")).await;

        let msg = DataMessage::new("a", "2", "");
        let blocked = {
            let pending = pending.clone();
            let msg = msg.clone();
            tokio::spawn(async move { pending.record_sent(msg).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;

        pending.close();
        match timeout(Duration::from_secs(1), blocked).await.unwrap().unwrap() {
            PendingInsert::Closed(m) => assert_eq!(m, msg),
            other => panic!("expected Closed, was {:?}", other),
        }

        assert_eq!(pending.drain().await.len(), 1);
        assert!(pending.is_empty().await);
    }

    #[tokio::test]
    async fn test_send_message() {
        let (client, mut server) = tokio::io::duplex(1024);
        let conn = PeerConnection::new(PeerClass::Message, SocketAddr::from(([127, 0, 0, 1], 9000)), Box::new(client), 10);

        conn.send_message(&Message::identify("x")).await.unwrap();
        let frame = crate::framing::read_frame(&mut server, 1024).await.unwrap().unwrap();
        assert_eq!(Message::deser(&frame).unwrap(), Message::identify("x"));
    }
}
