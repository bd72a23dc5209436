use chrono::NaiveDate;
use terrawatch::BoundingBox;

#[test]
fn test_accepts_valid_boxes() {
    assert!(BoundingBox::new(77.37, 12.734, 77.88, 13.173).is_ok());
    assert!(BoundingBox::new(-180.0, -90.0, 180.0, 90.0).is_ok());
    assert!(BoundingBox::new(-0.001, -0.001, 0.001, 0.001).is_ok());
}

#[test]
fn test_rejects_degenerate_boxes() {
    // north <= south
    assert!(BoundingBox::new(77.0, 13.0, 78.0, 13.0).is_err());
    assert!(BoundingBox::new(77.0, 13.5, 78.0, 13.0).is_err());
    // east <= west
    assert!(BoundingBox::new(78.0, 12.0, 78.0, 13.0).is_err());
    assert!(BoundingBox::new(78.5, 12.0, 78.0, 13.0).is_err());
}

#[test]
fn test_rejects_out_of_range_coordinates() {
    assert!(BoundingBox::new(-181.0, 12.0, 78.0, 13.0).is_err());
    assert!(BoundingBox::new(77.0, 12.0, 181.0, 13.0).is_err());
    assert!(BoundingBox::new(77.0, -91.0, 78.0, 13.0).is_err());
    assert!(BoundingBox::new(77.0, 12.0, 78.0, 91.0).is_err());
}

#[test]
fn test_key_string_rounds_to_six_decimals() {
    let date = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
    let a = BoundingBox::new(77.123_456_71, 12.0, 78.0, 13.0).unwrap();
    let b = BoundingBox::new(77.123_456_74, 12.0, 78.0, 13.0).unwrap();
    let c = BoundingBox::new(77.123_457_9, 12.0, 78.0, 13.0).unwrap();

    // Sub-micro-degree jitter collapses onto the same key; larger
    // differences do not.
    assert_eq!(a.key_string(date), b.key_string(date));
    assert_ne!(a.key_string(date), c.key_string(date));
}

#[test]
fn test_wms_string_orders_south_west_north_east() {
    let bbox = BoundingBox::new(77.37, 12.734, 77.88, 13.173).unwrap();
    assert_eq!(bbox.wms_string(), "12.734,77.37,13.173,77.88");
}

#[test]
fn test_grid_cells_tile_without_overlap() {
    let bbox = BoundingBox::new(10.0, 40.0, 11.0, 41.0).unwrap();
    let cells = bbox.grid(3);
    assert_eq!(cells.len(), 9);

    for cell in &cells {
        assert!(cell.bbox.west() >= bbox.west() - 1e-12);
        assert!(cell.bbox.east() <= bbox.east() + 1e-12);
        assert!(cell.bbox.south() >= bbox.south() - 1e-12);
        assert!(cell.bbox.north() <= bbox.north() + 1e-12);
    }

    // Adjacent cells share edges exactly.
    let step = 1.0 / 3.0;
    for cell in &cells {
        let expected_west = bbox.west() + cell.col as f64 * step;
        assert!((cell.bbox.west() - expected_west).abs() < 1e-9);
    }
}
