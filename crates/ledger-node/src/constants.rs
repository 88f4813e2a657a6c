pub(crate) const DEFAULT_LISTEN: &str = "127.0.0.1:5000";
pub(crate) const DEFAULT_REQUIRED_FIELDS: [&str; 2] = ["voter_id", "party"];
pub(crate) const API_PREFIX: &str = "/api";
pub(crate) const MAX_TRACKED_JOBS: usize = 64;
