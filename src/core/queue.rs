//! Process-wide execution queue for backend calls.
//!
//! Every generation request in the process funnels through one queue so
//! that at most `max_concurrent` calls are in flight at a time, no matter
//! how many jobs or phases submitted them. Dispatch is FIFO: a fixed pool
//! of workers pulls entries off a shared channel in submission order.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::debug;

use crate::core::llm::{GenerateOutput, GenerateRequest};

/// The downstream call a queue worker performs for each entry.
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(&self, request: GenerateRequest) -> Result<GenerateOutput>;
}

struct QueueEntry {
    request: GenerateRequest,
    reply: oneshot::Sender<Result<GenerateOutput>>,
}

#[derive(Debug, Clone, Copy)]
pub struct QueueStatus {
    pub active: usize,
    pub queued: usize,
    pub max_concurrent: usize,
}

pub struct InvocationQueue {
    tx: mpsc::UnboundedSender<QueueEntry>,
    active: Arc<AtomicUsize>,
    queued: Arc<AtomicUsize>,
    max_concurrent: usize,
}

impl InvocationQueue {
    /// Spawn the worker pool. `max_concurrent` workers share one receiver,
    /// so submission order is dispatch order.
    pub fn start(invoker: Arc<dyn Invoker>, max_concurrent: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<QueueEntry>();
        let rx = Arc::new(Mutex::new(rx));
        let active = Arc::new(AtomicUsize::new(0));
        let queued = Arc::new(AtomicUsize::new(0));

        for worker in 0..max_concurrent.max(1) {
            let rx = rx.clone();
            let invoker = invoker.clone();
            let active = active.clone();
            let queued = queued.clone();
            tokio::spawn(async move {
                loop {
                    let entry = { rx.lock().await.recv().await };
                    let Some(entry) = entry else {
                        break;
                    };
                    queued.fetch_sub(1, Ordering::SeqCst);
                    active.fetch_add(1, Ordering::SeqCst);
                    debug!(worker, label = %entry.request.label, "dispatching");
                    let result = invoker.invoke(entry.request).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    // Submitter may have been dropped; nothing to do then.
                    let _ = entry.reply.send(result);
                }
            });
        }

        InvocationQueue {
            tx,
            active,
            queued,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Enqueue a request and wait for its result.
    pub async fn submit(&self, request: GenerateRequest) -> Result<GenerateOutput> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.queued.fetch_add(1, Ordering::SeqCst);
        self.tx
            .send(QueueEntry {
                request,
                reply: reply_tx,
            })
            .map_err(|_| anyhow!("execution queue is shut down"))?;
        reply_rx
            .await
            .map_err(|_| anyhow!("execution queue dropped the request"))?
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            active: self.active.load(Ordering::SeqCst),
            queued: self.queued.load(Ordering::SeqCst),
            max_concurrent: self.max_concurrent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::llm::TokenUsage;
    use std::time::Duration;

    fn request(label: &str) -> GenerateRequest {
        GenerateRequest {
            label: label.to_string(),
            system: String::new(),
            user: String::new(),
            model: None,
        }
    }

    fn output(text: &str) -> GenerateOutput {
        GenerateOutput {
            text: text.to_string(),
            usage: TokenUsage::default(),
            reasoning: None,
        }
    }

    /// Tracks the high-water mark of simultaneous invocations.
    struct GaugeInvoker {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Invoker for GaugeInvoker {
        async fn invoke(&self, request: GenerateRequest) -> Result<GenerateOutput> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(output(&request.label))
        }
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_the_bound() {
        let invoker = Arc::new(GaugeInvoker {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let queue = Arc::new(InvocationQueue::start(invoker.clone(), 3));

        let mut handles = Vec::new();
        for i in 0..20 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue.submit(request(&format!("call {}", i))).await
            }));
        }
        for h in handles {
            assert!(h.await.unwrap().is_ok());
        }
        assert!(invoker.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn single_worker_dispatches_in_submission_order() {
        struct OrderInvoker {
            seen: Mutex<Vec<String>>,
        }

        #[async_trait]
        impl Invoker for OrderInvoker {
            async fn invoke(&self, request: GenerateRequest) -> Result<GenerateOutput> {
                self.seen.lock().await.push(request.label.clone());
                Ok(output(&request.label))
            }
        }

        let invoker = Arc::new(OrderInvoker {
            seen: Mutex::new(Vec::new()),
        });
        let queue = InvocationQueue::start(invoker.clone(), 1);

        for i in 0..5 {
            queue.submit(request(&format!("{}", i))).await.unwrap();
        }
        let seen = invoker.seen.lock().await;
        assert_eq!(*seen, vec!["0", "1", "2", "3", "4"]);
    }

    #[tokio::test]
    async fn errors_propagate_to_the_submitter() {
        struct FailingInvoker;

        #[async_trait]
        impl Invoker for FailingInvoker {
            async fn invoke(&self, _request: GenerateRequest) -> Result<GenerateOutput> {
                Err(anyhow!("backend down"))
            }
        }

        let queue = InvocationQueue::start(Arc::new(FailingInvoker), 2);
        let err = queue.submit(request("doomed")).await.unwrap_err();
        assert!(format!("{}", err).contains("backend down"));
    }

    #[tokio::test]
    async fn status_reflects_the_configured_bound() {
        struct NoopInvoker;

        #[async_trait]
        impl Invoker for NoopInvoker {
            async fn invoke(&self, request: GenerateRequest) -> Result<GenerateOutput> {
                Ok(output(&request.label))
            }
        }

        let queue = InvocationQueue::start(Arc::new(NoopInvoker), 3);
        let status = queue.status();
        assert_eq!(status.max_concurrent, 3);
        assert_eq!(status.active, 0);
    }
}
