//! Engine configuration surface (§4.4.1, §6.4).

/// Required engine configuration. `is_configured` must hold before any
/// sync operation runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncConfig {
    pub base_url: String,
    pub auth_token: String,
    pub technician_id: String,
}

impl SyncConfig {
    pub fn new(
        base_url: impl Into<String>,
        auth_token: impl Into<String>,
        technician_id: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            auth_token: auth_token.into(),
            technician_id: technician_id.into(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.base_url.trim().is_empty()
            && !self.auth_token.trim().is_empty()
            && !self.technician_id.trim().is_empty()
    }
}

/// Feature flags read once at engine construction (§6.4). Tests pass an
/// overriding `EngineFlags` rather than mutating process-wide globals.
#[derive(Debug, Clone)]
pub struct EngineFlags {
    pub parallel_entities: bool,
    pub max_parallel_entities: usize,
    pub parallel_safe_entities: Vec<String>,
    pub sequential_entities: Vec<String>,

    pub fast_push_only: bool,
    pub fast_push_debounce_ms: u64,
    pub fast_push_max_buffer_size: usize,
    pub fast_push_schedule_full_sync: bool,
    pub full_sync_throttle_ms: u64,
    pub full_sync_prefer_wifi: bool,

    pub event_pending_count: bool,
    pub pending_count_poll_interval_ms: u64,

    pub bulk_insert_chunk_size: usize,
    pub bulk_insert_bisect_min_size: usize,
    pub bulk_insert_continue_on_error: bool,

    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub mutation_cleanup_days: i64,
}

impl Default for EngineFlags {
    fn default() -> Self {
        Self {
            parallel_entities: false,
            max_parallel_entities: 2,
            parallel_safe_entities: Vec::new(),
            sequential_entities: Vec::new(),

            fast_push_only: false,
            fast_push_debounce_ms: 1_500,
            fast_push_max_buffer_size: 20,
            fast_push_schedule_full_sync: true,
            full_sync_throttle_ms: 5 * 60 * 1_000,
            full_sync_prefer_wifi: false,

            event_pending_count: true,
            pending_count_poll_interval_ms: 5_000,

            bulk_insert_chunk_size: 50,
            bulk_insert_bisect_min_size: 1,
            bulk_insert_continue_on_error: true,

            request_timeout_secs: 30,
            max_retries: 5,
            mutation_cleanup_days: 7,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_configured_until_all_three_fields_set() {
        let mut cfg = SyncConfig::default();
        assert!(!cfg.is_configured());
        cfg.base_url = "https://api.example.com".to_string();
        assert!(!cfg.is_configured());
        cfg.auth_token = "token".to_string();
        assert!(!cfg.is_configured());
        cfg.technician_id = "tech-1".to_string();
        assert!(cfg.is_configured());
    }

    #[test]
    fn blank_strings_do_not_count_as_configured() {
        let cfg = SyncConfig::new(" ", "token", "tech-1");
        assert!(!cfg.is_configured());
    }
}
