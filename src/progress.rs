//! Progress events emitted during discovery and transfer.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ProgressEvent {
    DiscoveryProgress {
        index: usize,
        total: usize,
        current_path: String,
    },
    ItemStart {
        item_index: usize,
        total_items: usize,
        source: String,
    },
    TransferStart {
        total_files: usize,
        total_bytes: u64,
    },
    FileProgress {
        file_rel_path: String,
        bytes_copied_for_file: u64,
        cumulative_bytes_copied: u64,
        total_bytes: u64,
    },
    FileComplete {
        file_rel_path: String,
        cumulative_bytes_copied: u64,
        total_bytes: u64,
    },
    TransferComplete {
        cumulative_bytes_copied: u64,
    },
}

/// Receives progress events. Called synchronously by the engine, possibly
/// from a blocking worker thread, so implementations must be cheap.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn emit(&self, event: ProgressEvent) {
        self(event)
    }
}

impl ProgressSink for tokio::sync::mpsc::UnboundedSender<ProgressEvent> {
    fn emit(&self, event: ProgressEvent) {
        // receiver gone means nobody is watching anymore
        let _ = self.send(event);
    }
}

pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: ProgressEvent) {}
}

pub fn null_sink() -> Arc<dyn ProgressSink> {
    Arc::new(NullSink)
}

/// Records every event, in order.
#[derive(Debug, Default)]
pub struct ProgressLog {
    events: Mutex<Vec<ProgressEvent>>,
}

impl ProgressLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl ProgressSink for ProgressLog {
    fn emit(&self, event: ProgressEvent) {
        self.events.lock().push(event);
    }
}

/// Byte accounting for one tree transfer.
pub(crate) struct TreeProgress {
    sink: Arc<dyn ProgressSink>,
    total_bytes: u64,
    done: u64,
}

impl TreeProgress {
    pub(crate) fn start(sink: Arc<dyn ProgressSink>, total_files: usize, total_bytes: u64) -> Self {
        sink.emit(ProgressEvent::TransferStart {
            total_files,
            total_bytes,
        });
        Self {
            sink,
            total_bytes,
            done: 0,
        }
    }

    /// Callback for chunk-level progress within one file.
    pub(crate) fn file_reporter(&self, rel: String) -> impl FnMut(u64) + Send + 'static {
        let sink = Arc::clone(&self.sink);
        let before = self.done;
        let total = self.total_bytes;
        move |copied| {
            sink.emit(ProgressEvent::FileProgress {
                file_rel_path: rel.clone(),
                bytes_copied_for_file: copied,
                cumulative_bytes_copied: before + copied,
                total_bytes: total,
            })
        }
    }

    pub(crate) fn file_done(&mut self, rel: String, size: u64) {
        self.done += size;
        self.sink.emit(ProgressEvent::FileComplete {
            file_rel_path: rel,
            cumulative_bytes_copied: self.done,
            total_bytes: self.total_bytes,
        });
    }

    pub(crate) fn finish(self) -> u64 {
        self.sink.emit(ProgressEvent::TransferComplete {
            cumulative_bytes_copied: self.done,
        });
        self.done
    }

    pub(crate) fn bytes_done(&self) -> u64 {
        self.done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let event = ProgressEvent::FileComplete {
            file_rel_path: "sce_sys/param.json".into(),
            cumulative_bytes_copied: 10,
            total_bytes: 20,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "file-complete");
        assert_eq!(json["fileRelPath"], "sce_sys/param.json");
        assert_eq!(json["cumulativeBytesCopied"], 10);
    }

    #[test]
    fn test_tree_progress_is_monotonic() {
        let log = ProgressLog::new();
        let mut progress = TreeProgress::start(log.clone(), 2, 30);
        let mut report = progress.file_reporter("a".into());
        report(5);
        report(10);
        progress.file_done("a".into(), 10);
        let mut report = progress.file_reporter("b".into());
        report(20);
        progress.file_done("b".into(), 20);
        assert_eq!(progress.finish(), 30);

        let cumulative: Vec<u64> = log
            .events()
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::FileProgress {
                    cumulative_bytes_copied,
                    ..
                }
                | ProgressEvent::FileComplete {
                    cumulative_bytes_copied,
                    ..
                } => Some(*cumulative_bytes_copied),
                _ => None,
            })
            .collect();
        assert_eq!(cumulative, vec![5, 10, 10, 30, 30]);
        assert!(matches!(
            log.events().last(),
            Some(ProgressEvent::TransferComplete {
                cumulative_bytes_copied: 30
            })
        ));
    }

    #[tokio::test]
    async fn test_channel_sink() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sink: Arc<dyn ProgressSink> = Arc::new(tx);
        sink.emit(ProgressEvent::TransferComplete {
            cumulative_bytes_copied: 1,
        });
        drop(sink);
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }
}
