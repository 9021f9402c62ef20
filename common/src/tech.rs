use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Opaque layer handle. Layers are registered once from the technology
/// description and referenced by handle everywhere else.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Layer(pub u16);

/// Orders a layer pair so that symmetric lookups share one table entry.
pub fn ordered_layers(lhs: Layer, rhs: Layer) -> (Layer, Layer) {
    if lhs <= rhs { (lhs, rhs) } else { (rhs, lhs) }
}

/// Minimum-geometry rules for one routing layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LayerRules {
    pub name: String,
    pub min_width: i64,
    pub min_separation: i64,
    pub pitch: i64,
    #[serde(default)]
    pub min_area: i64,
}

/// Rules for the via connecting one pair of adjacent layers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ViaRules {
    pub between: String,
    pub and: String,
    pub width: i64,
    pub height: i64,
    #[serde(default = "default_via_cost")]
    pub cost: f64,
    pub overhang_length: i64,
    pub overhang_width: i64,
}

fn default_via_cost() -> f64 {
    1.0
}

#[derive(Debug, Default, Deserialize)]
struct TechFile {
    #[serde(default)]
    layers: Vec<LayerRules>,
    #[serde(default)]
    vias: Vec<ViaRules>,
}

/// The read-only technology database: per-layer rules and per-layer-pair
/// via rules, loaded once per process.
#[derive(Debug, Default)]
pub struct TechDb {
    layers: Vec<LayerRules>,
    layers_by_name: HashMap<String, Layer>,
    vias: HashMap<(Layer, Layer), ViaRules>,
}

impl TechDb {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading technology file {:?}", path))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        let parsed: TechFile = toml::from_str(text).context("parsing technology TOML")?;
        let mut db = TechDb::default();
        for rules in parsed.layers {
            db.add_layer(rules)?;
        }
        for via in parsed.vias {
            db.add_via(via)?;
        }
        Ok(db)
    }

    pub fn add_layer(&mut self, rules: LayerRules) -> anyhow::Result<Layer> {
        if self.layers_by_name.contains_key(&rules.name) {
            return Err(anyhow!("duplicate layer definition: {}", rules.name));
        }
        let layer = Layer(self.layers.len() as u16);
        self.layers_by_name.insert(rules.name.clone(), layer);
        self.layers.push(rules);
        Ok(layer)
    }

    pub fn add_via(&mut self, via: ViaRules) -> anyhow::Result<()> {
        let first = self
            .find_layer(&via.between)
            .ok_or_else(|| anyhow!("via references unknown layer: {}", via.between))?;
        let second = self
            .find_layer(&via.and)
            .ok_or_else(|| anyhow!("via references unknown layer: {}", via.and))?;
        let key = ordered_layers(first, second);
        if self.vias.contains_key(&key) {
            return Err(anyhow!(
                "duplicate via definition between {} and {}",
                via.between,
                via.and
            ));
        }
        self.vias.insert(key, via);
        Ok(())
    }

    pub fn find_layer(&self, name: &str) -> Option<Layer> {
        self.layers_by_name.get(name).copied()
    }

    pub fn layer_name(&self, layer: Layer) -> &str {
        &self.layers[layer.0 as usize].name
    }

    pub fn rules(&self, layer: Layer) -> &LayerRules {
        &self.layers[layer.0 as usize]
    }

    pub fn via_rules(&self, lhs: Layer, rhs: Layer) -> Option<&ViaRules> {
        self.vias.get(&ordered_layers(lhs, rhs))
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TECH: &str = r#"
        [[layers]]
        name = "met1"
        min_width = 140
        min_separation = 140
        pitch = 340

        [[layers]]
        name = "met2"
        min_width = 140
        min_separation = 140
        pitch = 340

        [[vias]]
        between = "met1"
        and = "met2"
        width = 150
        height = 150
        cost = 2.0
        overhang_length = 85
        overhang_width = 55
    "#;

    #[test]
    fn loads_layers_and_vias() {
        let db = TechDb::from_toml_str(TECH).unwrap();
        let m1 = db.find_layer("met1").unwrap();
        let m2 = db.find_layer("met2").unwrap();
        assert_eq!(db.rules(m1).pitch, 340);
        assert!(db.via_rules(m1, m2).is_some());
        assert!(db.via_rules(m2, m1).is_some());
        assert_eq!(db.via_rules(m1, m2).unwrap().cost, 2.0);
    }

    #[test]
    fn rejects_duplicates() {
        let mut db = TechDb::from_toml_str(TECH).unwrap();
        let dup = LayerRules {
            name: "met1".to_string(),
            min_width: 1,
            min_separation: 1,
            pitch: 1,
            min_area: 0,
        };
        assert!(db.add_layer(dup).is_err());
    }
}
