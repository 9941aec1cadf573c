use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub tag: String,
    pub attrs: BTreeMap<String, String>,
}

impl Element {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into(), attrs: BTreeMap::new() }
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageEvent {
    pub kind: String,
    pub target: Option<Element>,
}

impl PageEvent {
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into(), target: None }
    }

    pub fn on(mut self, target: Element) -> Self {
        self.target = Some(target);
        self
    }
}

pub type EventListener = Arc<dyn Fn(&PageEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerKey(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OverlayKey(u64);

/// The slice of the page document plugins and the modal are allowed to touch.
pub trait PageDom: Send + Sync {
    fn add_listener(&self, event: &str, listener: EventListener) -> ListenerKey;
    fn remove_listener(&self, key: ListenerKey) -> bool;
    fn mount_overlay(&self, label: &str) -> OverlayKey;
    fn unmount_overlay(&self, key: OverlayKey) -> bool;
    fn query(&self, tag: &str) -> Vec<Element>;
}

/// In-process page used by the CLI simulation and tests.
#[derive(Default)]
pub struct MemoryPage {
    elements: Vec<Element>,
    listeners: Mutex<BTreeMap<ListenerKey, (String, EventListener)>>,
    overlays: Mutex<BTreeMap<OverlayKey, String>>,
    next_key: AtomicU64,
}

impl MemoryPage {
    pub fn new(elements: Vec<Element>) -> Arc<Self> {
        Arc::new(Self { elements, ..Default::default() })
    }

    fn listeners(&self) -> MutexGuard<'_, BTreeMap<ListenerKey, (String, EventListener)>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn overlay_nodes(&self) -> MutexGuard<'_, BTreeMap<OverlayKey, String>> {
        self.overlays.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next(&self) -> u64 {
        self.next_key.fetch_add(1, Ordering::Relaxed)
    }

    /// Deliver `event` to every listener registered for its kind.
    pub fn fire(&self, event: &PageEvent) -> usize {
        let targets: Vec<EventListener> = self
            .listeners()
            .values()
            .filter(|(kind, _)| *kind == event.kind)
            .map(|(_, l)| l.clone())
            .collect();
        for listener in &targets {
            listener(event);
        }
        targets.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners().len()
    }

    /// Labels of the mounted overlay nodes.
    pub fn overlays(&self) -> Vec<String> {
        self.overlay_nodes().values().cloned().collect()
    }
}

impl PageDom for MemoryPage {
    fn add_listener(&self, event: &str, listener: EventListener) -> ListenerKey {
        let key = ListenerKey(self.next());
        self.listeners().insert(key, (event.to_string(), listener));
        key
    }

    fn remove_listener(&self, key: ListenerKey) -> bool {
        self.listeners().remove(&key).is_some()
    }

    fn mount_overlay(&self, label: &str) -> OverlayKey {
        let key = OverlayKey(self.next());
        self.overlay_nodes().insert(key, label.to_string());
        debug!("Mounted overlay `{label}`");
        key
    }

    fn unmount_overlay(&self, key: OverlayKey) -> bool {
        self.overlay_nodes().remove(&key).is_some()
    }

    fn query(&self, tag: &str) -> Vec<Element> {
        self.elements
            .iter()
            .filter(|e| e.tag.eq_ignore_ascii_case(tag))
            .cloned()
            .collect()
    }
}

impl fmt::Debug for MemoryPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPage")
            .field("elements", &self.elements.len())
            .field("listeners", &self.listener_count())
            .field("overlays", &self.overlays())
            .finish()
    }
}

/// A plugin's view of the page. Remembers the listeners attached through
/// it so the session can remove whatever the plugin forgot to.
#[derive(Clone)]
pub struct PageHandle {
    dom: Arc<dyn PageDom>,
    plugin_id: String,
    attached: Arc<Mutex<Vec<ListenerKey>>>,
}

impl PageHandle {
    pub fn new(dom: Arc<dyn PageDom>, plugin_id: impl Into<String>) -> Self {
        Self { dom, plugin_id: plugin_id.into(), attached: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    fn attached(&self) -> MutexGuard<'_, Vec<ListenerKey>> {
        self.attached.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_listener<F>(&self, event: &str, listener: F) -> ListenerKey
    where
        F: Fn(&PageEvent) + Send + Sync + 'static,
    {
        let key = self.dom.add_listener(event, Arc::new(listener));
        self.attached().push(key);
        key
    }

    pub fn remove_listener(&self, key: ListenerKey) -> bool {
        self.attached().retain(|k| *k != key);
        self.dom.remove_listener(key)
    }

    pub fn query(&self, tag: &str) -> Vec<Element> {
        self.dom.query(tag)
    }

    /// Remove every listener still attached. Returns how many were left over.
    pub fn detach_all(&self) -> usize {
        let keys: Vec<ListenerKey> = self.attached().drain(..).collect();
        keys.into_iter().filter(|k| self.dom.remove_listener(*k)).count()
    }
}

impl fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageHandle")
            .field("plugin_id", &self.plugin_id)
            .field("attached", &self.attached().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn events_reach_matching_listeners() {
        let page = MemoryPage::new(vec![]);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        page.add_listener("click", Arc::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(page.fire(&PageEvent::new("click")), 1);
        assert_eq!(page.fire(&PageEvent::new("keydown")), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handle_detaches_leftovers() {
        let page = MemoryPage::new(vec![]);
        let handle = PageHandle::new(page.clone(), "css-spy");
        let a = handle.add_listener("mouseover", |_| {});
        handle.add_listener("click", |_| {});
        assert!(handle.remove_listener(a));
        assert_eq!(page.listener_count(), 1);
        assert_eq!(handle.detach_all(), 1);
        assert_eq!(page.listener_count(), 0);
    }

    #[test]
    fn query_matches_tag_case_insensitively() {
        let page = MemoryPage::new(vec![
            Element::new("IMG").attr("src", "a.png"),
            Element::new("div"),
        ]);
        let imgs = page.query("img");
        assert_eq!(imgs.len(), 1);
        assert_eq!(imgs[0].get("src"), Some("a.png"));
    }
}
