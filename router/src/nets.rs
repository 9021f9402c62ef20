use std::collections::BTreeSet;

/// A set of net-name aliases considered electrically identical. One alias
/// may be nominated the primary, the name given to newly created objects
/// on the net. A non-empty primary is always a member of the set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EquivalentNets {
    nets: BTreeSet<String>,
    primary: String,
}

impl EquivalentNets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_name(sole: &str) -> Self {
        let mut nets = Self::default();
        nets.set_primary(sole);
        nets
    }

    pub fn from_names<I: IntoIterator<Item = String>>(names: I) -> Self {
        let mut nets = Self::default();
        for name in names {
            nets.add(&name);
        }
        nets
    }

    pub fn contains(&self, name: &str) -> bool {
        !name.is_empty() && self.nets.contains(name)
    }

    pub fn add(&mut self, name: &str) -> bool {
        if name.is_empty() {
            return false;
        }
        self.nets.insert(name.to_string())
    }

    pub fn delete(&mut self, name: &str) -> bool {
        self.nets.remove(name)
    }

    pub fn merge(&mut self, other: &EquivalentNets) {
        for name in &other.nets {
            self.nets.insert(name.clone());
        }
        if self.primary.is_empty() {
            self.primary = other.primary.clone();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }

    pub fn primary(&self) -> &str {
        &self.primary
    }

    pub fn set_primary(&mut self, primary: &str) {
        self.primary = primary.to_string();
        self.add(primary);
    }

    pub fn intersects(&self, other: &EquivalentNets) -> bool {
        self.nets.iter().any(|name| other.contains(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.nets.iter().map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty() {
        let nets = EquivalentNets::new();
        assert!(nets.is_empty());
        assert!(!nets.contains(""));
        assert!(!nets.contains("a"));
    }

    #[test]
    fn primary_is_member() {
        let mut nets = EquivalentNets::from_name("vdd");
        assert!(nets.contains("vdd"));
        assert_eq!(nets.primary(), "vdd");
        nets.add("vpwr");
        assert!(nets.contains("vpwr"));
        nets.set_primary("vpwr");
        assert_eq!(nets.primary(), "vpwr");
        assert!(nets.contains("vdd"));
    }

    #[test]
    fn merge_keeps_first_primary() {
        let mut a = EquivalentNets::from_name("a");
        let b = EquivalentNets::from_name("b");
        a.merge(&b);
        assert_eq!(a.primary(), "a");
        assert!(a.contains("b"));
        assert!(a.intersects(&b));
    }
}
