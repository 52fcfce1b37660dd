// Canonical key layout: every queue key is `<prefix>:<queueName>:<suffix>`

/// Key builder for one queue.
#[derive(Debug, Clone)]
pub struct KeyLayout {
    prefix: String,
    queue_name: String,
    /// `<prefix>:<queueName>:` - job ids append directly
    base: String,
}

impl KeyLayout {
    pub fn new(prefix: impl Into<String>, queue_name: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let queue_name = queue_name.into();
        let base = format!("{}:{}:", prefix, queue_name);
        Self {
            prefix,
            queue_name,
            base,
        }
    }

    /// Layout of a sibling queue under the same prefix (flows span queues).
    pub fn sibling(&self, queue_name: &str) -> KeyLayout {
        KeyLayout::new(self.prefix.clone(), queue_name)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// `<prefix>:<queueName>` - used in cross-queue parent references
    pub fn queue_key(&self) -> String {
        format!("{}:{}", self.prefix, self.queue_name)
    }

    /// The base all scripts concatenate job ids onto
    pub fn base(&self) -> &str {
        &self.base
    }

    fn suffixed(&self, suffix: &str) -> String {
        format!("{}{}", self.base, suffix)
    }

    pub fn id(&self) -> String {
        self.suffixed("id")
    }

    pub fn wait(&self) -> String {
        self.suffixed("wait")
    }

    pub fn paused(&self) -> String {
        self.suffixed("paused")
    }

    pub fn active(&self) -> String {
        self.suffixed("active")
    }

    pub fn prioritized(&self) -> String {
        self.suffixed("prioritized")
    }

    /// Priority counter; also the FIFO sequence source for composite scores
    pub fn pc(&self) -> String {
        self.suffixed("pc")
    }

    pub fn delayed(&self) -> String {
        self.suffixed("delayed")
    }

    pub fn completed(&self) -> String {
        self.suffixed("completed")
    }

    pub fn failed(&self) -> String {
        self.suffixed("failed")
    }

    pub fn waiting_children(&self) -> String {
        self.suffixed("waiting-children")
    }

    pub fn stalled_check(&self) -> String {
        self.suffixed("stalled-check")
    }

    pub fn stalled(&self) -> String {
        self.suffixed("stalled")
    }

    pub fn marker(&self) -> String {
        self.suffixed("marker")
    }

    pub fn events(&self) -> String {
        self.suffixed("events")
    }

    pub fn meta(&self) -> String {
        self.suffixed("meta")
    }

    pub fn repeat(&self) -> String {
        self.suffixed("repeat")
    }

    pub fn repeat_def(&self, key: &str) -> String {
        self.suffixed(&format!("repeat:{}", key))
    }

    pub fn limiter(&self) -> String {
        self.suffixed("limiter")
    }

    pub fn job(&self, id: &str) -> String {
        self.suffixed(id)
    }

    pub fn logs(&self, id: &str) -> String {
        self.suffixed(&format!("{}:logs", id))
    }

    pub fn lock(&self, id: &str) -> String {
        self.suffixed(&format!("{}:lock", id))
    }
}
