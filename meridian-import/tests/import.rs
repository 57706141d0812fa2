//! End-to-end pipeline test: spool a small raw dataset, run the importer,
//! and query the produced database.

use enumset::enum_set;
use meridian_db::database::{Database, DatabaseParameter, TypeSet};
use meridian_db::geom::{GeoBox, GeoCoord};
use meridian_db::io::AccessMode;
use meridian_db::progress::SilentProgress;
use meridian_db::route_node::{ROUTE_DAT, ROUTE_IDX, RouteNodeStore};
use meridian_db::types::{
    FeatureKind, ObjectKind, TagCondition, TypeConfig, TypeInfo,
};
use meridian_db::Vehicle;
use meridian_import::raw::{MemberType, ScratchWriter};
use meridian_import::{Importer, ImporterParameter};
use std::sync::Arc;

fn test_config() -> TypeConfig {
    let mut config = TypeConfig::new();

    let highway = config.register_tag("highway");
    let landuse = config.register_tag("landuse");
    let boundary = config.register_tag("boundary");
    let amenity = config.register_tag("amenity");
    let housenumber = config.register_tag("addr:housenumber");

    config
        .register_type(
            TypeInfo::new("highway_residential")
                .with_way()
                .with_path()
                .with_route(Vehicle::Foot)
                .with_route(Vehicle::Bicycle)
                .with_route(Vehicle::Car)
                .with_index_as_location()
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
        .register_type(
            TypeInfo::new("landuse_forest")
                .with_area()
                .with_relation()
                .with_feature(FeatureKind::Name)
                .with_condition(
                    ObjectKind::Way | ObjectKind::Area | ObjectKind::Relation,
                    TagCondition::Equals {
                        tag: landuse,
                        value: "forest".into(),
                    },
                ),
        )
        .unwrap();

    config
        .register_type(
            TypeInfo::new("boundary_administrative")
                .with_area()
                .with_relation()
                .with_index_as_region()
                .with_feature(FeatureKind::Name)
                .with_feature(FeatureKind::AdminLevel)
                .with_condition(
                    ObjectKind::Way | ObjectKind::Area | ObjectKind::Relation,
                    TagCondition::Equals {
                        tag: boundary,
                        value: "administrative".into(),
                    },
                ),
        )
        .unwrap();

    config
        .register_type(
            TypeInfo::new("amenity_fountain")
                .with_node()
                .with_index_as_poi()
                .with_feature(FeatureKind::Name)
                .with_condition(
                    enum_set!(ObjectKind::Node),
                    TagCondition::Equals {
                        tag: amenity,
                        value: "fountain".into(),
                    },
                ),
        )
        .unwrap();

    config
        .register_type(
            TypeInfo::new("address")
                .with_node()
                .with_index_as_address()
                .with_feature(FeatureKind::Address)
                .with_feature(FeatureKind::Location)
                .with_condition(
                    enum_set!(ObjectKind::Node),
                    TagCondition::Exists { tag: housenumber },
                ),
        )
        .unwrap();

    config
}

fn build_database(dir: &std::path::Path) -> Database {
    let mut config = test_config();

    let mut scratch = ScratchWriter::new(dir, &mut config);

    // Administrative boundary as a closed way.
    scratch.add_node(1, 50.00, 7.00, &[]);
    scratch.add_node(2, 50.00, 7.10, &[]);
    scratch.add_node(3, 50.10, 7.10, &[]);
    scratch.add_node(4, 50.10, 7.00, &[]);
    scratch.add_way(
        100,
        &[1, 2, 3, 4, 1],
        &[
            ("boundary", "administrative"),
            ("name", "Bonn"),
            ("admin_level", "6"),
        ],
    );

    // Forest multipolygon: the outer ring split over two open ways, the
    // hole a closed way of the same type (old-school clip tagging).
    scratch.add_node(5, 50.02, 7.02, &[]);
    scratch.add_node(6, 50.02, 7.08, &[]);
    scratch.add_node(7, 50.08, 7.08, &[]);
    scratch.add_node(8, 50.08, 7.02, &[]);
    scratch.add_node(9, 50.04, 7.04, &[]);
    scratch.add_node(10, 50.04, 7.06, &[]);
    scratch.add_node(11, 50.06, 7.06, &[]);
    scratch.add_node(12, 50.06, 7.04, &[]);
    scratch.add_way(101, &[5, 6, 7], &[("landuse", "forest")]);
    scratch.add_way(102, &[7, 8, 5], &[("landuse", "forest")]);
    scratch.add_way(103, &[9, 10, 11, 12, 9], &[("landuse", "forest")]);
    scratch.add_relation(
        200,
        &[
            (MemberType::Way, 101, "outer"),
            (MemberType::Way, 102, "outer"),
            (MemberType::Way, 103, "inner"),
        ],
        &[("type", "multipolygon"), ("landuse", "forest")],
    );

    // A street of two ways sharing node 14.
    scratch.add_node(13, 50.010, 7.010, &[]);
    scratch.add_node(14, 50.012, 7.012, &[]);
    scratch.add_node(15, 50.014, 7.014, &[]);
    scratch.add_way(
        104,
        &[13, 14],
        &[
            ("highway", "residential"),
            ("name", "Hauptstraße"),
            ("maxspeed", "30"),
        ],
    );
    scratch.add_way(
        105,
        &[14, 15],
        &[("highway", "residential"), ("name", "Hauptstraße")],
    );

    // A POI and an address inside the boundary.
    scratch.add_node(
        16,
        50.011,
        7.011,
        &[("amenity", "fountain"), ("name", "Marktbrunnen")],
    );
    scratch.add_node(
        17,
        50.013,
        7.013,
        &[("addr:housenumber", "3"), ("addr:street", "Hauptstraße")],
    );

    scratch.finish().unwrap();

    Importer::new(ImporterParameter::default())
        .run(config, dir, &SilentProgress)
        .unwrap();

    Database::open(dir, &DatabaseParameter::default()).unwrap()
}

#[test]
fn import_produces_a_queryable_database() {
    let dir = tempfile::tempdir().unwrap();
    let database = build_database(dir.path());
    let config = database.type_config();

    let query_box = GeoBox::new(GeoCoord::new(49.99, 6.99), GeoCoord::new(50.11, 7.11));
    let all_types = TypeSet::from_types(config.types().iter().filter(|t| !t.is_ignore()));
    let data = database.get_objects(&all_types, &query_box).unwrap();

    // Ways: the two street segments. The multipolygon members are
    // blacklisted and must not appear standalone.
    assert_eq!(data.ways.len(), 2);
    for way in &data.ways {
        assert_eq!(way.type_info().name(), "highway_residential");
        assert_eq!(
            way.buffer.text_of(FeatureKind::Name),
            Some("Hauptstraße")
        );
    }

    // Areas: the boundary (closed way) and the forest multipolygon.
    assert_eq!(data.areas.len(), 2);

    let forest = data
        .areas
        .iter()
        .find(|a| a.type_info().name() == "landuse_forest")
        .expect("forest area");

    // Master ring plus assembled outer ring plus the hole.
    assert_eq!(forest.rings.len(), 3);
    let outer = &forest.rings[1];
    let hole = &forest.rings[2];
    assert_eq!(outer.depth, 1);
    assert_eq!(outer.nodes.len(), 4, "shared chain nodes deduplicated");
    assert_eq!(hole.depth, 2);
    // The hole carried the same type as its parent: retyped to a clip
    // region with the original type kept as a sidecar.
    assert!(hole.buffer.is_none());
    assert_eq!(hole.original_type.as_deref(), Some("landuse_forest"));

    let boundary = data
        .areas
        .iter()
        .find(|a| a.type_info().name() == "boundary_administrative")
        .expect("boundary area");
    assert_eq!(
        boundary.master_buffer().text_of(FeatureKind::Name),
        Some("Bonn")
    );

    // Nodes: POI and address node.
    assert_eq!(data.nodes.len(), 2);
}

#[test]
fn import_builds_location_hierarchy() {
    let dir = tempfile::tempdir().unwrap();
    let database = build_database(dir.path());

    let location = database.location_index().expect("location index");
    assert_eq!(location.region_count(), 1);

    let results = location.search("bonn hauptstraße", 10).unwrap();
    assert!(!results.is_empty());
    assert_eq!(results[0].region, "Bonn");
    assert_eq!(results[0].location.as_deref(), Some("Hauptstraße"));
    // Both street segments are merged into one location.
    assert_eq!(results[0].objects.len(), 2);

    let with_address = location.search("bonn hauptstraße 3", 10).unwrap();
    assert_eq!(with_address[0].address.as_deref(), Some("3"));

    let poi = location.search("bonn marktbrunnen", 10).unwrap();
    assert_eq!(poi[0].location.as_deref(), Some("Marktbrunnen"));
}

#[test]
fn import_builds_a_route_graph() {
    let dir = tempfile::tempdir().unwrap();
    let database = build_database(dir.path());

    let store = RouteNodeStore::open(
        database.type_config().clone(),
        dir.path().join(ROUTE_DAT),
        dir.path().join(ROUTE_IDX),
        AccessMode::FastRandom,
        true,
        100,
    )
    .unwrap();

    // Node 14 joins the two street segments.
    let junction = store.get(14).unwrap().expect("route node at junction");
    assert_eq!(junction.paths.len(), 2);
    assert!(junction.paths.iter().all(|p| p.max_speed == 30 || p.max_speed == 0));

    // Endpoints become route nodes as well.
    let start = store.get(13).unwrap().expect("route node at endpoint");
    assert_eq!(start.paths.len(), 1);
    let target = store.get_by_offset(start.paths[0].target_offset).unwrap();
    assert_eq!(target.id, 14);

    // Non-junction interior ids of non-routable ways have no route node.
    assert!(store.get(1).unwrap().is_none());
}

#[test]
fn low_zoom_index_serves_optimized_types_only() {
    let dir = tempfile::tempdir().unwrap();
    let database = build_database(dir.path());

    // No type in this fixture is flagged for optimisation; the index exists
    // but serves nothing, so the query falls back to full geometry.
    let config = Arc::clone(database.type_config());
    let residential = config.type_by_name("highway_residential").unwrap();
    let query_box = GeoBox::new(GeoCoord::new(49.99, 6.99), GeoCoord::new(50.11, 7.11));

    let ways = database
        .get_ways_low_zoom(
            meridian_db::tile::Magnification::new(8),
            &[residential.way_id()],
            &query_box,
        )
        .unwrap();
    assert_eq!(ways.len(), 2);
}
