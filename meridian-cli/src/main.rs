use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use meridian_db::database::{Database, DatabaseParameter};
use meridian_db::geom::{GeoBox, GeoCoord};
use meridian_db::types::TypeConfig;
use meridian_db::{RefType, Vehicle};
use meridian_router::description::{Description, DescriptionKey, Instruction, TurnKind};
use meridian_router::postprocess::{PostprocessContext, PostprocessorPipeline};
use meridian_router::profile::{BicycleProfile, CarProfile, FootProfile, RoutingProfile};
use meridian_router::{RoutePosition, Router, RouterParameter};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "meridian", author, version, about = "Meridian database demos", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
#[group(multiple = false)]
struct VehicleArgs {
    /// Route on foot
    #[arg(long)]
    foot: bool,
    /// Route by bicycle
    #[arg(long)]
    bicycle: bool,
    /// Route by car (default)
    #[arg(long)]
    car: bool,
}

impl VehicleArgs {
    fn vehicle(&self) -> Vehicle {
        if self.foot {
            Vehicle::Foot
        } else if self.bicycle {
            Vehicle::Bicycle
        } else {
            Vehicle::Car
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Calculate a route and print turn-by-turn instructions
    Route {
        #[command(flatten)]
        vehicle: VehicleArgs,
        /// Database directory
        database: PathBuf,
        start_lat: f64,
        start_lon: f64,
        target_lat: f64,
        target_lon: f64,
    },
    /// Fuzzy location search
    Locate {
        /// Database directory
        database: PathBuf,
        /// Query string, e.g. "bonn marktplatz 3"
        query: String,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Route {
            vehicle,
            database,
            start_lat,
            start_lon,
            target_lat,
            target_lon,
        } => route(
            &database,
            vehicle.vehicle(),
            GeoCoord::try_new(start_lat, start_lon).context("invalid start coordinate")?,
            GeoCoord::try_new(target_lat, target_lon).context("invalid target coordinate")?,
        ),
        Commands::Locate { database, query } => locate(&database, &query),
    }
}

fn build_profile(config: &TypeConfig, vehicle: Vehicle) -> Box<dyn RoutingProfile> {
    match vehicle {
        Vehicle::Foot => Box::new(FootProfile::new()),
        Vehicle::Bicycle => Box::new(BicycleProfile::new()),
        Vehicle::Car => {
            let mut profile = CarProfile::new(160.0);
            // Every car-routable type gets a plausible default speed; a real
            // deployment would feed a per-type table.
            let speeds: Vec<(String, f64)> = config
                .types()
                .iter()
                .filter(|t| t.can_route_car())
                .map(|t| (t.name().to_string(), 90.0))
                .collect();
            let speed_refs: Vec<(&str, f64)> =
                speeds.iter().map(|(n, s)| (n.as_str(), *s)).collect();
            profile.parametrize(config, &speed_refs, 160.0);
            Box::new(profile)
        }
    }
}

/// Finds the routable way node closest to the given coordinate.
fn find_closest_position(
    database: &Database,
    vehicle: Vehicle,
    coord: GeoCoord,
) -> anyhow::Result<Option<RoutePosition>> {
    let config = database.type_config();
    let routable_types: Vec<_> = config
        .types()
        .iter()
        .filter(|t| t.can_route(vehicle) && t.way_id() != 0)
        .map(|t| t.way_id())
        .collect();

    for radius in [0.002, 0.01, 0.05] {
        let search_box = GeoBox::new(
            GeoCoord::new(
                (coord.lat() - radius).max(-90.0),
                (coord.lon() - radius).max(-180.0),
            ),
            GeoCoord::new(
                (coord.lat() + radius).min(90.0),
                (coord.lon() + radius).min(180.0),
            ),
        );

        let offsets = database.way_offsets(&routable_types, &search_box)?;

        let mut best: Option<(f64, RoutePosition)> = None;
        for offset in offsets {
            let way = database.ways().get_by_offset(offset)?;
            for (index, point) in way.nodes.iter().enumerate() {
                let distance = point.coord.distance_m(&coord);
                if best.as_ref().is_none_or(|(d, _)| distance < *d) {
                    best = Some((
                        distance,
                        RoutePosition::new(
                            meridian_db::ObjectFileRef::new(RefType::Way, offset),
                            index,
                        ),
                    ));
                }
            }
        }

        if let Some((_, position)) = best {
            return Ok(Some(position));
        }
    }

    Ok(None)
}

fn route(
    directory: &PathBuf,
    vehicle: Vehicle,
    start: GeoCoord,
    target: GeoCoord,
) -> anyhow::Result<()> {
    let database = Database::open(directory, &DatabaseParameter::default())
        .with_context(|| format!("cannot open database at {}", directory.display()))?;
    let router = Router::open(directory, &RouterParameter::default())
        .with_context(|| format!("cannot open router data at {}", directory.display()))?;

    let profile = build_profile(router.type_config(), vehicle);

    let Some(start_position) = find_closest_position(&database, vehicle, start)? else {
        println!("No routable way near the start position.");
        return Ok(());
    };
    let Some(target_position) = find_closest_position(&database, vehicle, target)? else {
        println!("No routable way near the target position.");
        return Ok(());
    };

    let result = router.calculate_route(profile.as_ref(), start_position, target_position)?;
    tracing::debug!(?result.statistics, "route calculation finished");

    let Some(route) = result.route else {
        println!("No route found.");
        return Ok(());
    };

    let mut description = router.transform_route_data_to_description(&route)?;

    let ctx = PostprocessContext {
        profile: profile.as_ref(),
        router: &router,
        database: Some(&database),
        motorway_types: motorway_type_names(router.type_config()),
        motorway_link_types: HashSet::new(),
        junction_types: HashSet::new(),
    };
    PostprocessorPipeline::standard("Start", "Target").run(&ctx, &mut description)?;

    print_description(&description);
    Ok(())
}

fn motorway_type_names(config: &TypeConfig) -> HashSet<String> {
    config
        .types()
        .iter()
        .filter(|t| t.name().starts_with("highway_motorway"))
        .map(|t| t.name().to_string())
        .collect()
}

fn print_description(description: &meridian_router::description::RouteDescription) {
    for node in description.nodes() {
        let mut lines: Vec<String> = Vec::new();

        for instruction in node.instructions() {
            lines.push(match instruction {
                Instruction::Start => match node.description(DescriptionKey::WayName) {
                    Some(Description::WayName {
                        name: Some(name), ..
                    }) => format!("Start along '{name}'"),
                    _ => "Start".to_string(),
                },
                Instruction::Target => "Target reached".to_string(),
                Instruction::Turn { kind } => turn_text(*kind).to_string(),
                Instruction::RoundaboutEnter => "Enter roundabout".to_string(),
                Instruction::RoundaboutLeave { exit_count } => {
                    format!("Leave roundabout at exit {exit_count}")
                }
                Instruction::MotorwayEnter { to } => {
                    format!("Enter motorway {}", quoted_or(to, "(unnamed)"))
                }
                Instruction::MotorwayChange { to, .. } => {
                    format!("Continue on motorway {}", quoted_or(to, "(unnamed)"))
                }
                Instruction::MotorwayLeave { from } => {
                    format!("Leave motorway {}", quoted_or(from, "(unnamed)"))
                }
                Instruction::NameChanged { to, .. } => {
                    format!("Continue along {}", quoted_or(to, "(unnamed)"))
                }
            });
        }

        if lines.is_empty() {
            continue;
        }

        let km = node.distance_m / 1000.0;
        for (index, line) in lines.iter().enumerate() {
            if index == 0 {
                println!("{km:6.2}km {line}");
            } else {
                println!("         {line}");
            }
        }
    }

    println!(
        "Total: {:.2}km, about {:.0} min",
        description.total_distance_m() / 1000.0,
        description.total_time_s() / 60.0
    );
}

fn quoted_or(name: &Option<String>, fallback: &str) -> String {
    match name {
        Some(name) => format!("'{name}'"),
        None => fallback.to_string(),
    }
}

fn turn_text(kind: TurnKind) -> &'static str {
    match kind {
        TurnKind::SharpLeft => "Turn sharp left",
        TurnKind::Left => "Turn left",
        TurnKind::SlightlyLeft => "Turn slightly left",
        TurnKind::StraightOn => "Straight on",
        TurnKind::SlightlyRight => "Turn slightly right",
        TurnKind::Right => "Turn right",
        TurnKind::SharpRight => "Turn sharp right",
    }
}

fn locate(directory: &PathBuf, query: &str) -> anyhow::Result<()> {
    let database = Database::open(directory, &DatabaseParameter::default())
        .with_context(|| format!("cannot open database at {}", directory.display()))?;

    let Some(index) = database.location_index() else {
        bail!("this database carries no location index");
    };

    let results = index.search(query, 20)?;
    if results.is_empty() {
        println!("Nothing found.");
        return Ok(());
    }

    for result in results {
        let mut line = result.region.clone();
        if let Some(location) = &result.location {
            line.push_str(", ");
            line.push_str(location);
        }
        if let Some(address) = &result.address {
            line.push(' ');
            line.push_str(address);
        }
        println!(
            "{line} [{:?}/{:?}/{:?}]",
            result.region_quality, result.location_quality, result.address_quality
        );
    }

    Ok(())
}
