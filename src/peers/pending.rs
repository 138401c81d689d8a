use dashmap::DashMap;

/// Solicitation token → username, for the duration of an indirect attempt.
pub(crate) struct PendingSolicitations {
    map: DashMap<u32, String>,
}

impl PendingSolicitations {
    pub fn new() -> Self {
        Self { map: DashMap::new() }
    }

    pub fn insert(&self, token: u32, username: &str) {
        self.map.insert(token, username.to_string());
    }

    pub fn remove(&self, token: u32) -> Option<String> {
        self.map.remove(&token).map(|(_, username)| username)
    }

    pub fn username_for(&self, token: u32) -> Option<String> {
        self.map.get(&token).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn clear(&self) {
        self.map.clear();
    }
}

/// Removes a pending solicitation on every exit path of an indirect
/// attempt, resolved or not.
pub(crate) struct SolicitationGuard<'a> {
    pending: &'a PendingSolicitations,
    token: u32,
}

impl<'a> SolicitationGuard<'a> {
    pub fn new(pending: &'a PendingSolicitations, token: u32) -> Self {
        Self { pending, token }
    }
}

impl Drop for SolicitationGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.token);
    }
}
