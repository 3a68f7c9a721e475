use std::path::PathBuf;

use chrono::{TimeZone, Utc};
use dealbot_adapters::{FixtureListingSource, ListingSource};
use dealbot_core::Price;

fn fixture_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .join("fixtures/steam-specials/sample/search_results.html")
}

#[tokio::test]
async fn sample_specials_page_parses_into_listings() {
    let at = Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap();
    let source = FixtureListingSource::new(fixture_path()).observed_at(at);

    let listings = source.fetch_listings().await.expect("fixture parses");

    let names: Vec<_> = listings.keys().cloned().collect();
    assert_eq!(names, ["Celeste", "Hades", "Hollow Knight", "Indie Bundle"]);

    let hollow = &listings["Hollow Knight"];
    assert_eq!(hollow.discount_percent, 50);
    assert_eq!(hollow.original_price, Price::Known("14.79€".into()));
    assert_eq!(hollow.current_price, Price::Known("7.39€".into()));
    assert!(hollow.link.starts_with("https://store.steampowered.com/app/367520/"));

    let bundle = &listings["Indie Bundle"];
    assert_eq!(bundle.discount_percent, 60);
    assert_eq!(bundle.original_price, Price::Unknown);
}

#[tokio::test]
async fn missing_fixture_is_a_fetch_error() {
    let source = FixtureListingSource::new("/definitely/not/here.html");
    assert!(source.fetch_listings().await.is_err());
}
