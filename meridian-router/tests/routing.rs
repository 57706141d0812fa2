//! Routing end-to-end tests over a small imported database.

use enumset::enum_set;
use meridian_db::database::{Database, DatabaseParameter};
use meridian_db::progress::SilentProgress;
use meridian_db::types::{FeatureKind, ObjectKind, TagCondition, TypeConfig, TypeInfo};
use meridian_db::{ObjectFileRef, Vehicle};
use meridian_import::raw::ScratchWriter;
use meridian_import::{Importer, ImporterParameter};
use meridian_router::description::{DescriptionKey, Instruction};
use meridian_router::postprocess::{PostprocessContext, PostprocessorPipeline};
use meridian_router::profile::{CarProfile, FootProfile};
use meridian_router::{Router, RouterParameter, RoutePosition};
use std::collections::HashSet;
use std::path::Path;

fn test_config() -> TypeConfig {
    let mut config = TypeConfig::new();
    let highway = config.register_tag("highway");

    config
        .register_type(
            TypeInfo::new("highway_residential")
                .with_way()
                .with_path()
                .with_route(Vehicle::Foot)
                .with_route(Vehicle::Bicycle)
                .with_route(Vehicle::Car)
                .with_feature(FeatureKind::Name)
                .with_feature(FeatureKind::Access)
                .with_feature(FeatureKind::MaxSpeed)
                .with_condition(
                    enum_set!(ObjectKind::Way),
                    TagCondition::Equals {
                        tag: highway,
                        value: "residential".into(),
                    },
                ),
        )
        .unwrap();

    config
}

/// Two connected segments of 1 km each (N1 - N2 - N3), plus a disconnected
/// second component elsewhere.
fn build_database(dir: &Path) {
    let mut config = test_config();
    let mut scratch = ScratchWriter::new(dir, &mut config);

    scratch.add_node(1, 50.000, 7.0, &[]);
    scratch.add_node(2, 50.009, 7.0, &[]);
    scratch.add_node(3, 50.018, 7.0, &[]);
    scratch.add_way(
        10,
        &[1, 2],
        &[("highway", "residential"), ("name", "Nordstraße")],
    );
    scratch.add_way(
        11,
        &[2, 3],
        &[("highway", "residential"), ("name", "Südstraße")],
    );

    // Disconnected component.
    scratch.add_node(4, 52.000, 13.0, &[]);
    scratch.add_node(5, 52.009, 13.0, &[]);
    scratch.add_way(12, &[4, 5], &[("highway", "residential")]);

    scratch.finish().unwrap();
    Importer::new(ImporterParameter::default())
        .run(config, dir, &SilentProgress)
        .unwrap();
}

fn find_way_offsets(router: &Router, dir: &Path) -> (ObjectFileRef, ObjectFileRef, ObjectFileRef) {
    // Resolve the ways via their names by scanning the database.
    let database = Database::open(dir, &DatabaseParameter::default()).unwrap();
    let info = database
        .type_config()
        .type_by_name("highway_residential")
        .unwrap();
    let all = database
        .way_offsets(
            &[info.way_id()],
            &meridian_db::geom::GeoBox::new(
                meridian_db::geom::GeoCoord::new(-90.0, -180.0),
                meridian_db::geom::GeoCoord::new(90.0, 180.0),
            ),
        )
        .unwrap();

    let mut north = None;
    let mut south = None;
    let mut island = None;
    for offset in all {
        let way = router.ways().get_by_offset(offset).unwrap();
        match way.buffer.text_of(FeatureKind::Name) {
            Some("Nordstraße") => north = Some(way.object_ref()),
            Some("Südstraße") => south = Some(way.object_ref()),
            None => island = Some(way.object_ref()),
            _ => {}
        }
    }
    (north.unwrap(), south.unwrap(), island.unwrap())
}

#[test]
fn straight_line_route_over_three_nodes() {
    let dir = tempfile::tempdir().unwrap();
    build_database(dir.path());

    let router = Router::open(dir.path(), &RouterParameter::default()).unwrap();
    let (north, south, _) = find_way_offsets(&router, dir.path());

    let profile = FootProfile::new();
    let result = router
        .calculate_route(
            &profile,
            RoutePosition::new(north, 0),
            RoutePosition::new(south, 1),
        )
        .unwrap();

    let route = result.route.expect("a route must be found");

    // The route passes N1 -> N2 -> N3 plus the terminal entry.
    let points = router.transform_route_data_to_points(&route).unwrap();
    let ids: Vec<_> = points.iter().map(|p| p.id).collect();
    assert_eq!(ids, vec![1, 2, 3]);

    // 1 km per segment.
    let total: f64 = points
        .windows(2)
        .map(|w| w[0].coord.distance_m(&w[1].coord))
        .sum();
    assert!((total - 2000.0).abs() < 50.0, "total was {total}");

    // The line graph never needs more than a handful of open nodes.
    assert!(result.statistics.max_open_list <= 3);
}

#[test]
fn car_profile_finds_the_same_line() {
    let dir = tempfile::tempdir().unwrap();
    build_database(dir.path());

    let router = Router::open(dir.path(), &RouterParameter::default()).unwrap();
    let (north, south, _) = find_way_offsets(&router, dir.path());

    let mut profile = CarProfile::new(160.0);
    profile.parametrize(
        router.type_config(),
        &[("highway_residential", 50.0)],
        160.0,
    );

    let result = router
        .calculate_route(
            &profile,
            RoutePosition::new(north, 0),
            RoutePosition::new(south, 1),
        )
        .unwrap();
    assert!(result.route.is_some());
}

#[test]
fn disconnected_components_report_no_route() {
    let dir = tempfile::tempdir().unwrap();
    build_database(dir.path());

    let router = Router::open(dir.path(), &RouterParameter::default()).unwrap();
    let (north, _, island) = find_way_offsets(&router, dir.path());

    let profile = FootProfile::new();
    let result = router
        .calculate_route(
            &profile,
            RoutePosition::new(north, 0),
            RoutePosition::new(island, 1),
        )
        .unwrap();

    // A regular "not found", not an error; the search exhausted exactly the
    // reachable component (route nodes 1, 2 and 3).
    assert!(result.route.is_none());
    assert_eq!(result.statistics.max_closed_set, 3);
}

#[test]
fn identical_start_and_target_yield_a_single_terminal_entry() {
    let dir = tempfile::tempdir().unwrap();
    build_database(dir.path());

    let router = Router::open(dir.path(), &RouterParameter::default()).unwrap();
    let (north, _, _) = find_way_offsets(&router, dir.path());

    let profile = FootProfile::new();
    let result = router
        .calculate_route(
            &profile,
            RoutePosition::new(north, 0),
            RoutePosition::new(north, 0),
        )
        .unwrap();

    let route = result.route.expect("zero-length route");
    assert_eq!(route.entries().len(), 1);
    assert!(route.entries()[0].path_object.is_none());
}

fn description_fingerprint(
    description: &meridian_router::description::RouteDescription,
) -> Vec<(usize, u64, Vec<Instruction>, Option<String>)> {
    description
        .nodes()
        .iter()
        .map(|node| {
            (
                node.current_node_index,
                node.distance_m.round() as u64,
                node.instructions().to_vec(),
                node.way_name().map(str::to_string),
            )
        })
        .collect()
}

#[test]
fn postprocessor_pipeline_enriches_and_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    build_database(dir.path());

    let router = Router::open(dir.path(), &RouterParameter::default()).unwrap();
    let (north, south, _) = find_way_offsets(&router, dir.path());

    let profile = FootProfile::new();
    let result = router
        .calculate_route(
            &profile,
            RoutePosition::new(north, 0),
            RoutePosition::new(south, 1),
        )
        .unwrap();
    let route = result.route.unwrap();

    let mut description = router.transform_route_data_to_description(&route).unwrap();

    let ctx = PostprocessContext {
        profile: &profile,
        router: &router,
        database: None,
        motorway_types: HashSet::new(),
        motorway_link_types: HashSet::new(),
        junction_types: HashSet::new(),
    };

    let pipeline = PostprocessorPipeline::standard("Start", "Ziel");
    pipeline.run(&ctx, &mut description).unwrap();

    // Distance and time accumulate monotonically to ~2 km of walking.
    assert!((description.total_distance_m() - 2000.0).abs() < 50.0);
    let expected_seconds = 2000.0 / (5.0 / 3.6);
    assert!((description.total_time_s() - expected_seconds).abs() < 60.0);

    let first = &description.nodes()[0];
    assert!(first.has_description(DescriptionKey::Start));
    assert_eq!(first.way_name(), Some("Nordstraße"));
    assert!(first.instructions().contains(&Instruction::Start));

    let last = description.nodes().last().unwrap();
    assert!(last.has_description(DescriptionKey::Target));
    assert!(last.instructions().contains(&Instruction::Target));

    // The way name changes at N2.
    let name_change = description.nodes().iter().any(|node| {
        node.instructions().iter().any(|i| {
            matches!(
                i,
                Instruction::NameChanged { from: Some(from), to: Some(to) }
                    if from == "Nordstraße" && to == "Südstraße"
            )
        })
    });
    assert!(name_change, "expected a NameChanged instruction");

    // Running the pipeline a second time must leave the description
    // unchanged.
    let before = description_fingerprint(&description);
    pipeline.run(&ctx, &mut description).unwrap();
    assert_eq!(description_fingerprint(&description), before);
}

#[test]
fn profile_access_gating_blocks_unusable_types() {
    let dir = tempfile::tempdir().unwrap();
    build_database(dir.path());

    let router = Router::open(dir.path(), &RouterParameter::default()).unwrap();
    let (north, south, _) = find_way_offsets(&router, dir.path());

    // A car profile without any parametrized type speeds cannot use the
    // residential ways at all.
    let profile = CarProfile::new(160.0);
    let result = router
        .calculate_route(
            &profile,
            RoutePosition::new(north, 0),
            RoutePosition::new(south, 1),
        )
        .unwrap();
    assert!(result.route.is_none());
}
