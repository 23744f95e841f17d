#![forbid(unsafe_code)]
#![deny(
    unused_must_use,
    unreachable_pub,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]

//! Shared test helpers used across integration suites.

/// Postgres gating for integration tests.
pub mod postgres {
    /// Environment variable naming the database integration tests run
    /// against.
    pub const TEST_DATABASE_ENV: &str = "VIDRA_TEST_DATABASE_URL";

    /// Connection string for integration tests, when one is configured.
    ///
    /// Suites call this first and skip (with a note on stderr) when it
    /// returns `None`, so `cargo test` stays green on machines without a
    /// database.
    #[must_use]
    pub fn test_database_url() -> Option<String> {
        match std::env::var(TEST_DATABASE_ENV) {
            Ok(url) if !url.trim().is_empty() => Some(url),
            _ => {
                eprintln!("skipping database-backed tests: {TEST_DATABASE_ENV} is unset");
                None
            }
        }
    }
}

/// Small content fixtures shared by suites.
pub mod fixtures {
    /// A syntactically valid magnet URI with two tracker hints.
    pub const MAGNET: &str = "magnet:?xt=urn:btih:1234567890abcdef1234567890abcdef12345678\
        &dn=Example+Movie&tr=http://t1/announce&tr=http://t2/announce";

    /// A minimal SRT document with two cues.
    pub const SRT: &str = "1\n00:00:01,000 --> 00:00:04,000\nHello there.\n\n2\n00:02:10,500 --> 00:02:12,300\nGeneral greeting.\n";
}
