use std::collections::VecDeque;

/// Bounded queue of not-yet-flushed content deltas.
///
/// Deltas leave from the front once the queue reaches its capacity. An
/// element is held back while the text from some position inside it to the
/// end of the window is still a proper prefix of one of the watched tags, so
/// a tag split across small deltas never leaks before it is recognized.
#[derive(Debug, Clone)]
pub struct ContentWindow {
    items: VecDeque<String>,
    capacity: usize,
}

impl ContentWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    pub fn push(&mut self, delta: impl Into<String>) {
        self.items.push_back(delta.into());
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn joined(&self) -> String {
        self.items.iter().map(String::as_str).collect()
    }

    /// Replaces the contents with a single element.
    pub fn reset_to(&mut self, text: impl Into<String>) {
        let text = text.into();
        self.items.clear();
        if !text.is_empty() {
            self.items.push_back(text);
        }
    }

    pub fn drain_joined(&mut self) -> String {
        let joined = self.joined();
        self.items.clear();
        joined
    }

    /// Oldest element, if the window is full and the element cannot be the
    /// start of a partially received tag.
    pub fn pop_ready(&mut self, tags: &[String]) -> Option<String> {
        if self.items.len() < self.capacity {
            return None;
        }
        if self.front_may_start_tag(tags) {
            return None;
        }
        self.items.pop_front()
    }

    fn front_may_start_tag(&self, tags: &[String]) -> bool {
        let Some(front) = self.items.front() else {
            return false;
        };
        if tags.is_empty() {
            return false;
        }
        let joined = self.joined();
        front.char_indices().any(|(at, _)| {
            let tail = &joined[at..];
            tags.iter()
                .any(|tag| tail.len() < tag.len() && tag.starts_with(tail))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags() -> Vec<String> {
        vec!["<codebase_search>".to_string()]
    }

    #[test]
    fn evicts_oldest_once_full() {
        let mut window = ContentWindow::new(3);
        window.push("a");
        window.push("b");
        assert_eq!(window.pop_ready(&tags()), None);
        window.push("c");
        assert_eq!(window.pop_ready(&tags()).as_deref(), Some("a"));
        assert_eq!(window.pop_ready(&tags()), None);
        assert_eq!(window.joined(), "bc");
    }

    #[test]
    fn holds_back_partial_tag_until_disproved() {
        let mut window = ContentWindow::new(2);
        window.push("see <code");
        window.push("base");
        assert_eq!(window.pop_ready(&tags()), None);
        window.push("_sea");
        assert_eq!(window.pop_ready(&tags()), None);
        window.push("l!");
        assert_eq!(window.pop_ready(&tags()).as_deref(), Some("see <code"));
        assert_eq!(window.pop_ready(&tags()).as_deref(), Some("base"));
        assert_eq!(window.pop_ready(&tags()).as_deref(), Some("_sea"));
        assert_eq!(window.pop_ready(&tags()), None);
    }

    #[test]
    fn no_holdback_without_tags() {
        let mut window = ContentWindow::new(1);
        window.push("<co");
        assert_eq!(window.pop_ready(&[]).as_deref(), Some("<co"));
    }

    #[test]
    fn reset_and_drain() {
        let mut window = ContentWindow::new(4);
        window.push("x");
        window.reset_to("<codebase_search>");
        assert_eq!(window.len(), 1);
        window.push("q");
        assert_eq!(window.drain_joined(), "<codebase_search>q");
        assert!(window.is_empty());
        window.reset_to("");
        assert!(window.is_empty());
    }
}
