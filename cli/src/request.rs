use anyhow::{Context, anyhow, bail};
use gridroute_common::geom::{Point, Rect};
use gridroute_common::tech::TechDb;
use gridroute_router::grid::Terminal;
use gridroute_router::nets::EquivalentNets;
use gridroute_router::rules::{Direction, LayerInfo, ViaEncap, ViaInfo};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A routing request: a grid definition over exactly two layers, plus a
/// list of net route orders.
#[derive(Debug, Deserialize)]
pub struct Request {
    pub grid: GridDefinition,
    #[serde(default)]
    pub orders: Vec<OrderDefinition>,
}

#[derive(Debug, Deserialize)]
pub struct GridDefinition {
    pub layers: Vec<LayerDefinition>,
    #[serde(default)]
    pub vias: Vec<ViaDefinition>,
}

#[derive(Debug, Deserialize)]
pub struct LayerDefinition {
    pub name: String,
    pub direction: Direction,
    #[serde(default)]
    pub offset: i64,
    pub area: AreaDefinition,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct AreaDefinition {
    pub x0: i64,
    pub y0: i64,
    pub x1: i64,
    pub y1: i64,
}

impl AreaDefinition {
    pub fn as_rect(&self) -> Rect {
        Rect::new(Point::new(self.x0, self.y0), Point::new(self.x1, self.y1))
    }
}

#[derive(Debug, Deserialize)]
pub struct ViaDefinition {
    pub between: String,
    pub and: String,
    /// Overrides the technology's via cost for this grid.
    pub cost: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OrderDefinition {
    pub net: String,
    pub groups: Vec<GroupDefinition>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GroupDefinition {
    pub terminals: Vec<TerminalDefinition>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TerminalDefinition {
    pub x: i64,
    pub y: i64,
    pub layer: String,
}

impl Request {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading request file {:?}", path))?;
        toml::from_str(&text).context("parsing request TOML")
    }
}

/// A fully validated request, ready for graph construction.
#[derive(Debug)]
pub struct ValidatedRequest {
    pub layer_infos: Vec<LayerInfo>,
    pub via_infos: Vec<(gridroute_common::tech::Layer, gridroute_common::tech::Layer, ViaInfo)>,
    pub orders: Vec<(EquivalentNets, Vec<Vec<Terminal>>)>,
    pub area: Rect,
}

/// Validates a request against the technology database. Every rejection
/// here happens before any graph construction: wrong layer count, unknown
/// layer names, and missing via rules are all refused up front.
pub fn validate(request: &Request, tech: &TechDb) -> anyhow::Result<ValidatedRequest> {
    if request.grid.layers.len() < 2 {
        bail!("too few routing layer definitions");
    }
    if request.grid.layers.len() > 2 {
        bail!("too many routing layer definitions");
    }

    let mut layer_infos = Vec::new();
    for definition in &request.grid.layers {
        let layer = tech
            .find_layer(&definition.name)
            .ok_or_else(|| anyhow!("missing info for layer: \"{}\"", definition.name))?;
        let rules = tech.rules(layer);
        layer_infos.push(LayerInfo {
            layer,
            area: definition.area.as_rect(),
            wire_width: rules.min_width,
            offset: definition.offset,
            direction: definition.direction,
            pitch: rules.pitch,
            min_separation: rules.min_separation,
        });
    }

    let mut via_infos = Vec::new();
    let via_definitions: Vec<(String, String, Option<f64>)> = if request.grid.vias.is_empty()
    {
        // With no explicit via list, the pair's technology via is implied.
        vec![(
            request.grid.layers[0].name.clone(),
            request.grid.layers[1].name.clone(),
            None,
        )]
    } else {
        request
            .grid
            .vias
            .iter()
            .map(|v| (v.between.clone(), v.and.clone(), v.cost))
            .collect()
    };
    for (between, and, cost) in via_definitions {
        let first = tech
            .find_layer(&between)
            .ok_or_else(|| anyhow!("missing info for layer: \"{}\"", between))?;
        let second = tech
            .find_layer(&and)
            .ok_or_else(|| anyhow!("missing info for layer: \"{}\"", and))?;
        let rules = tech
            .via_rules(first, second)
            .ok_or_else(|| {
                anyhow!("routing via info unavailable for layers {} and {}", between, and)
            })?;
        let mut info = ViaInfo::new(
            gridroute_common::tech::ordered_layers(first, second).0,
            gridroute_common::tech::ordered_layers(first, second).1,
            rules.width,
            rules.height,
            cost.unwrap_or(rules.cost),
        );
        for layer in [first, second] {
            info.set_encap(
                layer,
                ViaEncap {
                    overhang_length: rules.overhang_length,
                    overhang_width: rules.overhang_width,
                },
            );
        }
        via_infos.push((first, second, info));
    }

    let mut orders = Vec::new();
    for order in &request.orders {
        if order.net.is_empty() {
            bail!("route order with empty net name");
        }
        if order.groups.len() < 2 {
            bail!(
                "route order for net \"{}\" needs at least two terminal groups",
                order.net
            );
        }
        let mut groups = Vec::new();
        for group in &order.groups {
            if group.terminals.is_empty() {
                bail!("route order for net \"{}\" has an empty terminal group", order.net);
            }
            let mut terminals = Vec::new();
            for terminal in &group.terminals {
                let layer = tech.find_layer(&terminal.layer).ok_or_else(|| {
                    anyhow!("missing info for layer: \"{}\"", terminal.layer)
                })?;
                terminals.push(Terminal {
                    centre: Point::new(terminal.x, terminal.y),
                    layer,
                    net: order.net.clone(),
                });
            }
            groups.push(terminals);
        }
        orders.push((EquivalentNets::from_name(&order.net), groups));
    }

    let area = layer_infos[0].area.overlap_with(&layer_infos[1].area);

    Ok(ValidatedRequest {
        layer_infos,
        via_infos,
        orders,
        area,
    })
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

    const REQUEST: &str = r#"
        [[grid.layers]]
        name = "met1"
        direction = "horizontal"
        offset = 340
        area = { x0 = 0, y0 = 0, x1 = 10000, y1 = 10000 }

        [[grid.layers]]
        name = "met2"
        direction = "vertical"
        offset = 340
        area = { x0 = 0, y0 = 0, x1 = 10000, y1 = 10000 }

        [[orders]]
        net = "clk"
        [[orders.groups]]
        terminals = [ { x = 340, y = 340, layer = "met1" } ]
        [[orders.groups]]
        terminals = [ { x = 3400, y = 3400, layer = "met2" } ]
    "#;

    fn parse(request: &str) -> anyhow::Result<ValidatedRequest> {
        let tech = TechDb::from_toml_str(TECH).unwrap();
        let request: Request = toml::from_str(request).unwrap();
        validate(&request, &tech)
    }

    #[test]
    fn accepts_well_formed_request() {
        let validated = parse(REQUEST).unwrap();
        assert_eq!(validated.layer_infos.len(), 2);
        assert_eq!(validated.via_infos.len(), 1);
        assert_eq!(validated.orders.len(), 1);
        assert_eq!(validated.orders[0].1.len(), 2);
    }

    #[test]
    fn rejects_wrong_layer_count() {
        let one_layer = REQUEST.replace(
            r#"[[grid.layers]]
        name = "met2"
        direction = "vertical"
        offset = 340
        area = { x0 = 0, y0 = 0, x1 = 10000, y1 = 10000 }

        "#,
            "",
        );
        assert!(parse(&one_layer).is_err());
    }

    #[test]
    fn rejects_unknown_layer() {
        let bad = REQUEST.replace("met2", "met9");
        let error = parse(&bad).unwrap_err();
        assert!(error.to_string().contains("met9"));
    }
}
