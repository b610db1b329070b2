use std::collections::VecDeque;

use tokio::sync::{Mutex, Notify};


/// An unbounded FIFO queue with blocking consumption and explicit closing.
///
/// Closing the queue marks the end of production: further pushes are refused (handing the
///  message back to the caller), while consumers keep receiving the messages that are still
///  queued. Once a closed queue runs empty, [MessageQueue::pop] returns `None`, which is how
///  consumers learn that they are done.
pub struct MessageQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

struct QueueState<T> {
    messages: VecDeque<T>,
    closed: bool,
}

impl<T> Default for MessageQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MessageQueue<T> {
    pub fn new() -> MessageQueue<T> {
        MessageQueue {
            state: Mutex::new(QueueState {
                messages: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    pub async fn push(&self, msg: T) -> Result<(), T> {
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(msg);
            }
            state.messages.push_back(msg);
        }
        self.notify.notify_one();
        Ok(())
    }

    pub async fn push_front(&self, msg: T) -> Result<(), T> {
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(msg);
            }
            state.messages.push_front(msg);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Appends a message that was previously taken from this queue by its consumer. This works
    ///  on a closed queue as well: the message was never 'produced' anew, so closing does not
    ///  affect it.
    pub async fn requeue(&self, msg: T) {
        self.state.lock().await
            .messages.push_back(msg);
        self.notify.notify_one();
    }

    /// Waits for the next message. Returns `None` only after the queue was closed and all
    ///  remaining messages were consumed.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                if let Some(msg) = state.messages.pop_front() {
                    return Some(msg);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub async fn try_pop(&self) -> Option<T> {
        self.state.lock().await
            .messages.pop_front()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await
            .messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await
            .closed
    }

    pub async fn close(&self) {
        self.state.lock().await
            .closed = true;
        self.notify.notify_waiters();
    }

    /// Removes and returns all queued messages
    pub async fn drain(&self) -> Vec<T> {
        self.state.lock().await
            .messages.drain(..)
            .collect()
    }
}
