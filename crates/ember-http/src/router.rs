/// Longest-prefix route table: `(path prefix → T)`, where `T` is whatever
/// the listener carries per route (handler plus settings).
///
/// Prefixes match on whole path segments: `/api` routes `/api` and
/// `/api/users`, never `/apiary`.
#[derive(Debug)]
pub struct Router<T> {
    /// Sorted by prefix length, longest first.
    routes: Vec<(String, T)>,
}

impl<T> Default for Router<T> {
    fn default() -> Self {
        Self { routes: Vec::new() }
    }
}

impl<T> Router<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a route. Prefixes are normalised to begin with `/`
    /// and drop a trailing `/`.
    pub fn route(&mut self, prefix: &str, value: T) {
        let prefix = normalise(prefix);
        if let Some(existing) = self.routes.iter_mut().find(|(p, _)| *p == prefix) {
            existing.1 = value;
            return;
        }
        self.routes.push((prefix, value));
        self.routes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    }

    /// Longest matching prefix wins.
    pub fn lookup(&self, path: &str) -> Option<&T> {
        self.routes.iter().find(|(prefix, _)| prefix_matches(prefix, path)).map(|(_, v)| v)
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.routes.iter().map(|(p, v)| (p.as_str(), v))
    }
}

fn normalise(prefix: &str) -> String {
    let mut prefix = prefix.trim().to_string();
    if !prefix.starts_with('/') {
        prefix.insert(0, '/');
    }
    while prefix.len() > 1 && prefix.ends_with('/') {
        prefix.pop();
    }
    prefix
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    path.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'))
}
