use serde::ser::{Serialize, SerializeMap, Serializer};

/// Ordered header multimap. Names are stored lower-cased, every name keeps
/// the list of values in the order they were received.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, Vec<String>)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        let name = name.to_ascii_lowercase();
        self.entries.iter().position(|(n, _)| *n == name)
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.position(name).map(|i| self.entries[i].1.as_slice())
    }

    /// First value of a header, which is how most single-valued headers are read.
    pub fn first(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.first()).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        match self.position(name) {
            Some(i) => self.entries[i].1.push(value.into()),
            None => self
                .entries
                .push((name.to_ascii_lowercase(), vec![value.into()])),
        }
    }

    pub fn prepend(&mut self, name: &str, value: impl Into<String>) {
        match self.position(name) {
            Some(i) => self.entries[i].1.insert(0, value.into()),
            None => self
                .entries
                .insert(0, (name.to_ascii_lowercase(), vec![value.into()])),
        }
    }

    /// Rewrites one value (`which`) or every value (`None`) of a header.
    /// Returns false when nothing was altered.
    pub fn alter<F>(&mut self, name: &str, which: Option<usize>, mut alteration: F) -> bool
    where
        F: FnMut(&str) -> String,
    {
        let Some(i) = self.position(name) else {
            return false;
        };
        let values = &mut self.entries[i].1;
        match which {
            Some(idx) => match values.get_mut(idx) {
                Some(value) => {
                    *value = alteration(value);
                    true
                }
                None => false,
            },
            None => {
                for value in values.iter_mut() {
                    *value = alteration(value);
                }
                true
            }
        }
    }

    /// Deletes one value (`which`) or the whole header (`None`).
    pub fn delete(&mut self, name: &str, which: Option<usize>) -> bool {
        let Some(i) = self.position(name) else {
            return false;
        };
        match which {
            None => {
                self.entries.remove(i);
                true
            }
            Some(idx) if idx < self.entries[i].1.len() => {
                self.entries[i].1.remove(idx);
                if self.entries[i].1.is_empty() {
                    self.entries.remove(i);
                }
                true
            }
            Some(_) => false,
        }
    }

    /// Index of the most recently added value of a header.
    pub fn newest_index(&self, name: &str) -> Option<usize> {
        self.get(name)
            .and_then(|values| values.len().checked_sub(1))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for HeaderMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, values) in &self.entries {
            map.serialize_entry(name, values)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.append("Subject", "hello");
        assert_eq!(headers.first("SUBJECT"), Some("hello"));
        assert!(headers.contains("subject"));
    }

    #[test]
    fn test_repeated_headers_keep_order() {
        let mut headers = HeaderMap::new();
        headers.append("Received", "one");
        headers.append("Received", "two");
        headers.prepend("Received", "zero");
        assert_eq!(headers.get("received").unwrap(), ["zero", "one", "two"]);
        assert_eq!(headers.newest_index("received"), Some(2));
    }

    #[test]
    fn test_prepend_new_header_goes_first() {
        let mut headers = HeaderMap::new();
        headers.append("From", "a@example.com");
        headers.prepend("X-Spam-Score", "1.0");
        let names: Vec<&str> = headers.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["x-spam-score", "from"]);
    }

    #[test]
    fn test_alter_and_delete() {
        let mut headers = HeaderMap::new();
        headers.append("Subject", "hello");
        headers.append("Subject", "again");
        assert!(headers.alter("subject", Some(1), |v| format!("[SPAM] {v}")));
        assert_eq!(headers.get("subject").unwrap()[1], "[SPAM] again");
        assert!(!headers.alter("subject", Some(5), |v| v.to_string()));

        assert!(headers.delete("subject", Some(0)));
        assert_eq!(headers.get("subject").unwrap(), ["[SPAM] again"]);
        assert!(headers.delete("subject", Some(0)));
        assert!(!headers.contains("subject"));
        assert!(!headers.delete("subject", None));
    }

    #[test]
    fn test_serializes_as_ordered_map() {
        let mut headers = HeaderMap::new();
        headers.append("To", "b@example.com");
        headers.append("From", "a@example.com");
        let json = serde_json::to_string(&headers).unwrap();
        assert_eq!(json, r#"{"to":["b@example.com"],"from":["a@example.com"]}"#);
    }
}
