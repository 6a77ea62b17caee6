//! Hierarchical key/value container backing query strings, form bodies and cookies.
//!
//! Keys follow the common form naming conventions:
//!
//! - `name` stores a single value, replacing any previous one
//! - `name[]` appends the value to the list stored under `name`
//! - `name[key]` stores the value in the map stored under `name`
//!
//! A dictionary may have child dictionaries; lookups fall back to the children
//! in order when the key is not found locally.

use std::collections::HashMap;

use crate::protocol::url::url_decode;

/// A value stored in a [`DataDictionary`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataValue {
    Single(String),
    List(Vec<String>),
    Map(HashMap<String, String>),
}

impl DataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            DataValue::Single(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            DataValue::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&HashMap<String, String>> {
        match self {
            DataValue::Map(map) => Some(map),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataDictionary {
    entries: HashMap<String, DataValue>,
    children: Vec<DataDictionary>,
}

impl DataDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a dictionary from a url-encoded `a=1&b=2` string.
    pub fn from_url_encoded(encoded: &str) -> Self {
        let mut dict = Self::new();
        dict.parse_url_encoded(encoded);
        dict
    }

    /// Adds every `key=value` pair of a url-encoded string.
    ///
    /// Pairs that don't split into exactly one key and one value are skipped.
    pub fn parse_url_encoded(&mut self, encoded: &str) {
        for pair in encoded.split('&') {
            let mut parts = pair.split('=');
            if let (Some(key), Some(value), None) = (parts.next(), parts.next(), parts.next()) {
                self.set(&url_decode(key), url_decode(value));
            }
        }
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();

        let Some(open) = key.find('[') else {
            self.entries.insert(key.to_string(), DataValue::Single(value));
            return;
        };

        let element = &key[..open];
        let close = match key.find(']') {
            Some(close) if close > open => close,
            _ => {
                self.entries.insert(element.to_string(), DataValue::Single(value));
                return;
            }
        };

        if close == open + 1 {
            match self.entries.get_mut(element) {
                Some(DataValue::List(list)) => list.push(value),
                _ => {
                    self.entries.insert(element.to_string(), DataValue::List(vec![value]));
                }
            }
            return;
        }

        let map_key = key[open + 1..close].to_string();
        match self.entries.get_mut(element) {
            Some(DataValue::Map(map)) => {
                map.insert(map_key, value);
            }
            _ => {
                self.entries.insert(element.to_string(), DataValue::Map(HashMap::from([(map_key, value)])));
            }
        }
    }

    /// Looks up the single value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.find(key, DataValue::as_str)
    }

    /// Looks up the list created by `key[]` entries.
    pub fn get_list(&self, key: &str) -> Option<&[String]> {
        self.find(key, DataValue::as_list)
    }

    /// Looks up the map created by `key[name]` entries.
    pub fn get_map(&self, key: &str) -> Option<&HashMap<String, String>> {
        self.find(key, DataValue::as_map)
    }

    pub fn get_value(&self, key: &str) -> Option<&DataValue> {
        self.find(key, Some)
    }

    fn find<'a, T: ?Sized>(&'a self, key: &str, pick: fn(&'a DataValue) -> Option<&'a T>) -> Option<&'a T> {
        if let Some(found) = self.entries.get(key).and_then(pick) {
            return Some(found);
        }
        self.children.iter().find_map(|child| child.find(key, pick))
    }

    /// Keys stored directly in this dictionary, children excluded.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get_value(key).is_some()
    }

    /// Number of entries in this dictionary and all of its children.
    pub fn len(&self) -> usize {
        self.entries.len() + self.children.iter().map(DataDictionary::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn children(&self) -> &[DataDictionary] {
        &self.children
    }

    pub fn add_child(&mut self, child: DataDictionary) {
        self.children.push(child);
    }

    /// Removes all entries and drops the children.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.children.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_values_replace() {
        let mut dict = DataDictionary::new();
        dict.set("a", "1");
        dict.set("a", "2");
        assert_eq!(dict.get("a"), Some("2"));
        assert_eq!(dict.len(), 1);
    }

    #[test]
    fn list_syntax_appends() {
        let mut dict = DataDictionary::new();
        dict.set("ids[]", "1");
        dict.set("ids[]", "2");
        assert_eq!(dict.get_list("ids"), Some(&["1".to_string(), "2".to_string()][..]));
        assert_eq!(dict.get("ids"), None);
    }

    #[test]
    fn list_replaces_a_single_value() {
        let mut dict = DataDictionary::new();
        dict.set("ids", "x");
        dict.set("ids[]", "1");
        assert_eq!(dict.get_list("ids").map(<[String]>::len), Some(1));
        assert_eq!(dict.get("ids"), None);
    }

    #[test]
    fn map_syntax_sets_entries() {
        let mut dict = DataDictionary::new();
        dict.set("user[name]", "ann");
        dict.set("user[age]", "7");
        dict.set("user[name]", "bob");
        let map = dict.get_map("user").unwrap();
        assert_eq!(map.get("name").map(String::as_str), Some("bob"));
        assert_eq!(map.get("age").map(String::as_str), Some("7"));
    }

    #[test]
    fn unbalanced_brackets_store_under_element() {
        let mut dict = DataDictionary::new();
        dict.set("a[b", "1");
        dict.set("c]d[", "2");
        assert_eq!(dict.get("a"), Some("1"));
        assert_eq!(dict.get("c]d"), Some("2"));
    }

    #[test]
    fn lookups_fall_back_to_children() {
        let query = DataDictionary::from_url_encoded("a=1&shared=query");
        let post = DataDictionary::from_url_encoded("b=2&shared=post");

        let mut data = DataDictionary::new();
        data.add_child(query);
        data.add_child(post);

        assert_eq!(data.get("a"), Some("1"));
        assert_eq!(data.get("b"), Some("2"));
        assert_eq!(data.get("shared"), Some("query"));
        assert_eq!(data.get("missing"), None);
        assert_eq!(data.len(), 4);
        assert!(data.contains_key("b"));
    }

    #[test]
    fn url_encoded_pairs() {
        let dict = DataDictionary::from_url_encoded("a=1&b=2&a%20b=c+d&bad&x=1=2&empty=");
        assert_eq!(dict.get("a"), Some("1"));
        assert_eq!(dict.get("b"), Some("2"));
        assert_eq!(dict.get("a b"), Some("c d"));
        assert_eq!(dict.get("empty"), Some(""));
        assert!(!dict.contains_key("bad"));
        assert!(!dict.contains_key("x"));
    }

    #[test]
    fn clear_drops_children() {
        let mut dict = DataDictionary::from_url_encoded("a=1");
        dict.add_child(DataDictionary::from_url_encoded("b=2"));
        dict.clear();
        assert!(dict.is_empty());
        assert!(dict.children().is_empty());
    }
}
