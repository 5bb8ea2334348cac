//! Diesel table declarations for §6.3's persistent state layout.

diesel::table! {
    mutations_queue (id) {
        id -> BigInt,
        entity -> Text,
        entity_id -> Text,
        operation -> Text,
        payload -> Text,
        created_at -> Text,
        attempts -> Integer,
        last_attempt -> Nullable<Text>,
        status -> Text,
        terminal_reason -> Text,
        error_message -> Nullable<Text>,
    }
}

diesel::table! {
    sync_meta (entity) {
        entity -> Text,
        last_cursor -> Nullable<Text>,
        last_sync_at -> Nullable<Text>,
    }
}

diesel::table! {
    sync_engine_state (id) {
        id -> Integer,
        status -> Text,
        last_sync_at -> Nullable<Text>,
        error -> Nullable<Text>,
    }
}
