use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            router: RouterConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RouterConfig {
    /// Worker threads for parallel order dispatch. 0 means one per
    /// hardware core.
    #[serde(default = "default_jobs")]
    pub jobs: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_vertex_cost")]
    pub vertex_cost: f64,
    /// Rings of surrounding tracks considered when bridging an off-grid
    /// terminal onto the grid.
    #[serde(default = "default_bridging_track_rings")]
    pub bridging_track_rings: i64,
    /// Extra window, in database units, around a blockage when collecting
    /// candidate vertices for invalidation.
    #[serde(default = "default_blockage_search_margin")]
    pub blockage_search_margin: i64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            jobs: default_jobs(),
            max_retries: default_max_retries(),
            vertex_cost: default_vertex_cost(),
            bridging_track_rings: default_bridging_track_rings(),
            blockage_search_margin: default_blockage_search_margin(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_report_file")]
    pub report_file: String,
    #[serde(default = "default_image_file")]
    pub image_file: String,
    #[serde(default = "default_image_size")]
    pub image_size: u32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            report_file: default_report_file(),
            image_file: default_image_file(),
            image_size: default_image_size(),
        }
    }
}

fn default_jobs() -> usize {
    0
}

fn default_max_retries() -> u32 {
    3
}

fn default_vertex_cost() -> f64 {
    1.0
}

fn default_bridging_track_rings() -> i64 {
    2
}

fn default_blockage_search_margin() -> i64 {
    0
}

fn default_report_file() -> String {
    "output/routes.toml".to_string()
}

fn default_image_file() -> String {
    "output/routed.png".to_string()
}

fn default_image_size() -> u32 {
    2000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config: Config = toml::from_str("[router]\njobs = 4\n").unwrap();
        assert_eq!(config.router.jobs, 4);
        assert_eq!(config.router.max_retries, 3);
        assert_eq!(config.output.image_size, 2000);
    }
}
