//! Replay capture.
//!
//! When tracing is enabled, every buffer-object creation and destruction is mirrored here
//! together with the head of every submitted chain, so that a capture can be decoded offline.
use parking_lot::Mutex;
use serde_json::json;
use std::{collections::BTreeMap, fs, io, path::Path};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CaptureEvent {
    Mmap { va: u64, size: u64, host_visible: bool },
    Free { va: u64, size: u64 },
    Chain { head: u64, fragment: bool },
}

#[derive(Default)]
struct CaptureInner {
    mappings: BTreeMap<u64, u64>,
    events: Vec<CaptureEvent>,
    contents: BTreeMap<u64, Vec<u8>>,
}

#[derive(Default)]
pub struct CaptureContext {
    inner: Mutex<CaptureInner>,
}

impl CaptureContext {
    pub fn new() -> CaptureContext {
        CaptureContext::default()
    }

    pub fn inject_mmap(&self, va: u64, size: u64, host_visible: bool) {
        let mut inner = self.inner.lock();
        inner.mappings.insert(va, size);
        inner.events.push(CaptureEvent::Mmap {
            va,
            size,
            host_visible,
        });
    }

    pub fn inject_free(&self, va: u64, size: u64) {
        let mut inner = self.inner.lock();
        inner.mappings.remove(&va);
        inner.contents.remove(&va);
        inner.events.push(CaptureEvent::Free { va, size });
    }

    pub fn record_chain(&self, head: u64, fragment: bool) {
        self.inner
            .lock()
            .events
            .push(CaptureEvent::Chain { head, fragment });
    }

    /// Stores the current contents of the mapping at `va`.
    pub fn snapshot(&self, va: u64, bytes: Vec<u8>) {
        self.inner.lock().contents.insert(va, bytes);
    }

    pub fn events(&self) -> Vec<CaptureEvent> {
        self.inner.lock().events.clone()
    }

    /// Mappings currently alive in the capture, as `(va, size)`.
    pub fn live_mappings(&self) -> Vec<(u64, u64)> {
        self.inner
            .lock()
            .mappings
            .iter()
            .map(|(&va, &size)| (va, size))
            .collect()
    }

    pub fn to_json(&self) -> serde_json::Value {
        let inner = self.inner.lock();

        let mappings: Vec<_> = inner
            .mappings
            .iter()
            .map(|(&va, &size)| {
                let contents = inner.contents.get(&va).map(|bytes| hex(bytes));
                json!({
                    "va": va,
                    "size": size,
                    "contents": contents,
                })
            })
            .collect();

        let chains: Vec<_> = inner
            .events
            .iter()
            .filter_map(|e| match *e {
                CaptureEvent::Chain { head, fragment } => Some(json!({
                    "head": head,
                    "fragment": fragment,
                })),
                _ => None,
            })
            .collect();

        json!({
            "mappings": mappings,
            "chains": chains,
        })
    }

    pub fn dump(&self, path: &Path) -> io::Result<()> {
        let text = serde_json::to_string_pretty(&self.to_json())?;
        fs::write(path, text)
    }
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{:02x}", b);
    }
    s
}
