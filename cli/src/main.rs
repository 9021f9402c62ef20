mod request;

use clap::{Parser, Subcommand};
use gridroute_common::tech::TechDb;
use gridroute_common::util::config::Config;
use gridroute_common::util::visualization::{self, DrawnRoute};
use gridroute_common::util::logger;
use gridroute_router::grid::Grid;
use gridroute_router::manager::{OrderReport, RouteManager};
use rand::Rng;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Builds the routing grid from a request file and routes its orders.
    Route {
        #[arg(long, value_name = "FILE", default_value = "tech.toml")]
        tech: PathBuf,
        #[arg(value_name = "FILE")]
        request: PathBuf,
    },
    /// Generates a random benchmark request over a two-layer grid.
    Generate {
        #[arg(long, value_name = "FILE", default_value = "tech.toml")]
        tech: PathBuf,
        #[arg(long, default_value_t = 50)]
        nets: usize,
        #[arg(long, default_value_t = 100)]
        tracks: i64,
        #[arg(long, default_value = "inputs/random_request.toml")]
        output: String,
    },
}

fn main() -> anyhow::Result<()> {
    logger::init();
    let args = Args::parse();

    let config = if args.config.exists() {
        log::info!("loading configuration from {:?}", args.config);
        let config_str = std::fs::read_to_string(&args.config)
            .map_err(|e| anyhow::anyhow!("failed to read config file: {}", e))?;
        toml::from_str(&config_str)
            .map_err(|e| anyhow::anyhow!("failed to parse config TOML: {}", e))?
    } else {
        log::warn!(
            "configuration file {:?} not found, using internal defaults",
            args.config
        );
        Config::default()
    };

    match args.command {
        Commands::Route { tech, request } => run_route(&config, &tech, &request),
        Commands::Generate {
            tech,
            nets,
            tracks,
            output,
        } => run_generate(&tech, nets, tracks, &output),
    }
}

#[derive(Serialize)]
struct RouteExport {
    net: String,
    points: Vec<PointExport>,
}

#[derive(Serialize)]
struct PointExport {
    x: i64,
    y: i64,
    layer: String,
}

#[derive(Serialize)]
struct ReportExport {
    orders: Vec<OrderReport>,
    routes: Vec<RouteExport>,
}

fn run_route(config: &Config, tech_path: &Path, request_path: &Path) -> anyhow::Result<()> {
    if !tech_path.exists() {
        anyhow::bail!("technology file missing: {:?}", tech_path);
    }
    if !request_path.exists() {
        anyhow::bail!("request file missing: {:?}", request_path);
    }

    log::info!("loading technology from {:?}", tech_path);
    let tech = TechDb::load(tech_path)?;

    log::info!("loading request from {:?}", request_path);
    let parsed = request::Request::load(request_path)?;
    let validated = request::validate(&parsed, &tech)
        .map_err(|e| anyhow::anyhow!("invalid request: {}", e))?;

    let mut grid = Grid::new(config.router.clone());
    for info in &validated.layer_infos {
        grid.add_layer_info(info.clone())
            .map_err(|e| anyhow::anyhow!(e))?;
    }
    for (lhs, rhs, info) in &validated.via_infos {
        grid.add_via_info(*lhs, *rhs, info.clone())
            .map_err(|e| anyhow::anyhow!(e))?;
    }
    grid.connect_layers(validated.layer_infos[0].layer, validated.layer_infos[1].layer)
        .map_err(|e| anyhow::anyhow!(e))?;

    log::info!("routing {} orders", validated.orders.len());
    let mut manager = RouteManager::new(config.router.clone());
    for (nets, groups) in validated.orders {
        manager.add_order(nets, groups);
    }
    let reports = manager.solve(&mut grid);

    let failed = reports.iter().filter(|r| !r.fully_routed()).count();
    if failed > 0 {
        log::warn!("{} of {} orders were not fully routed", failed, reports.len());
        for report in reports.iter().filter(|r| !r.fully_routed()) {
            for pair in &report.pairs {
                log::warn!(
                    "  net \"{}\" group {} -> {}: {:?}",
                    report.net,
                    pair.from_group,
                    pair.to_group,
                    pair.outcome
                );
            }
        }
    } else {
        log::info!("all {} orders routed", reports.len());
    }

    let routes: Vec<RouteExport> = grid
        .paths()
        .iter()
        .map(|path| RouteExport {
            net: path.nets().primary().to_string(),
            points: path
                .to_points_and_layers(&grid)
                .into_iter()
                .map(|(point, layer)| PointExport {
                    x: point.x,
                    y: point.y,
                    layer: tech.layer_name(layer).to_string(),
                })
                .collect(),
        })
        .collect();

    let export = ReportExport {
        orders: reports,
        routes,
    };
    write_report(&config.output.report_file, &export)?;

    draw(config, &grid, &validated.area);
    Ok(())
}

fn write_report(path_str: &str, export: &ReportExport) -> anyhow::Result<()> {
    if let Some(parent) = Path::new(path_str).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let text = toml::to_string_pretty(export)
        .map_err(|e| anyhow::anyhow!("serialising report: {}", e))?;
    std::fs::write(path_str, text)?;
    log::info!("wrote report to {}", path_str);
    Ok(())
}

fn draw(config: &Config, grid: &Grid, area: &gridroute_common::geom::Rect) {
    let mut drawn = Vec::new();
    let mut via_points = Vec::new();
    for path in grid.paths() {
        let geometry = path.to_geometry(grid);
        for polyline in geometry.polylines {
            drawn.push(DrawnRoute {
                layer: polyline.layer.0,
                points: polyline.points,
            });
        }
        for via in geometry.vias {
            via_points.push(via.at);
        }
    }
    log::info!("generating routed visualization");
    visualization::draw_routes(
        *area,
        &drawn,
        &via_points,
        &config.output.image_file,
        config.output.image_size,
    );
}

/// Emits a random request over the first two technology layers: pairwise
/// orders between grid-aligned points.
fn run_generate(
    tech_path: &Path,
    nets: usize,
    tracks: i64,
    output: &str,
) -> anyhow::Result<()> {
    if !tech_path.exists() {
        anyhow::bail!("technology file missing: {:?}", tech_path);
    }
    let tech = TechDb::load(tech_path)?;
    if tech.num_layers() < 2 {
        anyhow::bail!("technology must define at least two layers");
    }
    let first = tech.rules(gridroute_common::tech::Layer(0));
    let second = tech.rules(gridroute_common::tech::Layer(1));
    let pitch = first.pitch.max(second.pitch);
    let span = pitch * tracks;

    let mut rng = rand::thread_rng();
    let mut lines = Vec::new();
    lines.push(format!(
        "[[grid.layers]]\nname = \"{}\"\ndirection = \"horizontal\"\noffset = {}\narea = {{ x0 = 0, y0 = 0, x1 = {}, y1 = {} }}\n",
        first.name, pitch, span, span
    ));
    lines.push(format!(
        "[[grid.layers]]\nname = \"{}\"\ndirection = \"vertical\"\noffset = {}\narea = {{ x0 = 0, y0 = 0, x1 = {}, y1 = {} }}\n",
        second.name, pitch, span, span
    ));

    for index in 0..nets {
        let x0 = rng.gen_range(1..tracks) * pitch;
        let y0 = rng.gen_range(1..tracks) * pitch;
        let x1 = rng.gen_range(1..tracks) * pitch;
        let y1 = rng.gen_range(1..tracks) * pitch;
        lines.push(format!(
            "[[orders]]\nnet = \"net{}\"\n[[orders.groups]]\nterminals = [ {{ x = {}, y = {}, layer = \"{}\" }} ]\n[[orders.groups]]\nterminals = [ {{ x = {}, y = {}, layer = \"{}\" }} ]\n",
            index, x0, y0, first.name, x1, y1, second.name
        ));
    }

    if let Some(parent) = Path::new(output).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(output, lines.join("\n"))?;
    log::info!(
        "generated request with {} nets over a {}x{} track grid: {}",
        nets,
        tracks,
        tracks,
        output
    );
    Ok(())
}
