use crate::session::SessionThresholds;

#[derive(Debug, Clone)]
pub struct Config {
    pub abs_base_url: String,
    pub abs_api_key: String,
    pub hardcover_base_url: String,
    pub hardcover_token: String,
    pub db_connection_string: String,
    /// Cache rows are scoped to this identity.
    pub user_id: String,
    pub workers: usize,
    pub abs_max_concurrent: usize,
    pub abs_requests_per_minute: u32,
    pub hardcover_max_concurrent: usize,
    pub hardcover_requests_per_minute: u32,
    pub high_progress_threshold: f64,
    pub reread_threshold: f64,
    pub regression_warning_threshold: f64,
    pub completion_threshold: f64,
    pub auto_add_books: bool,
    pub force_sync: bool,
    pub dry_run: bool,
}

const DEFAULT_HARDCOVER_BASE_URL: &str = "https://api.hardcover.app/v1/graphql";
const DEFAULT_DB_CONNECTION_STRING: &str = "sqlite://cache.sqlite?mode=rwc";

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

impl Config {
    pub fn load() -> Self {
        let abs_base_url = std::env::var("ABS_BASE_URL").unwrap_or_default();
        let abs_api_key = std::env::var("ABS_API_KEY").unwrap_or_default();
        let hardcover_base_url =
            std::env::var("HARDCOVER_BASE_URL").unwrap_or(DEFAULT_HARDCOVER_BASE_URL.into());
        let hardcover_token = std::env::var("HARDCOVER_TOKEN").unwrap_or_default();
        let db_connection_string =
            std::env::var("DB_CONNECTION_STRING").unwrap_or(DEFAULT_DB_CONNECTION_STRING.into());
        let user_id = std::env::var("SYNC_USER_ID").unwrap_or("default".into());
        Config {
            abs_base_url,
            abs_api_key,
            hardcover_base_url,
            hardcover_token,
            db_connection_string,
            user_id,
            workers: env_or("SYNC_WORKERS", 3),
            abs_max_concurrent: env_or("ABS_MAX_CONCURRENT", 5),
            abs_requests_per_minute: env_or("ABS_REQUESTS_PER_MINUTE", 600),
            hardcover_max_concurrent: env_or("HARDCOVER_MAX_CONCURRENT", 1),
            hardcover_requests_per_minute: env_or("HARDCOVER_REQUESTS_PER_MINUTE", 55),
            high_progress_threshold: env_or("HIGH_PROGRESS_THRESHOLD", 85.0),
            reread_threshold: env_or("REREAD_THRESHOLD", 30.0),
            regression_warning_threshold: env_or("REGRESSION_WARNING_THRESHOLD", 10.0),
            completion_threshold: env_or("COMPLETION_THRESHOLD", 100.0),
            auto_add_books: env_flag("AUTO_ADD_BOOKS"),
            force_sync: env_flag("FORCE_SYNC"),
            dry_run: env_flag("DRY_RUN"),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.abs_base_url.is_empty() {
            return Err("ABS_BASE_URL is missing".into());
        }
        if self.abs_api_key.is_empty() {
            return Err("ABS_API_KEY is missing".into());
        }
        if self.hardcover_token.is_empty() {
            return Err("HARDCOVER_TOKEN is missing".into());
        }
        if self.workers == 0 {
            return Err("SYNC_WORKERS must be at least 1".into());
        }
        if self.abs_max_concurrent == 0 || self.hardcover_max_concurrent == 0 {
            return Err("max concurrent requests must be at least 1".into());
        }
        if self.abs_requests_per_minute == 0 || self.hardcover_requests_per_minute == 0 {
            return Err("requests per minute must be at least 1".into());
        }
        for (name, v) in [
            ("HIGH_PROGRESS_THRESHOLD", self.high_progress_threshold),
            ("REREAD_THRESHOLD", self.reread_threshold),
            (
                "REGRESSION_WARNING_THRESHOLD",
                self.regression_warning_threshold,
            ),
            ("COMPLETION_THRESHOLD", self.completion_threshold),
        ] {
            if !(0.0..=100.0).contains(&v) {
                return Err(format!("{} must be between 0 and 100", name));
            }
        }
        if self.reread_threshold >= self.high_progress_threshold {
            return Err("REREAD_THRESHOLD must be below HIGH_PROGRESS_THRESHOLD".into());
        }
        Ok(())
    }

    pub fn session_thresholds(&self) -> SessionThresholds {
        SessionThresholds {
            high_progress: self.high_progress_threshold,
            reread: self.reread_threshold,
            regression_warning: self.regression_warning_threshold,
        }
    }
}
