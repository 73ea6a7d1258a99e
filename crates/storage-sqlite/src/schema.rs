//! Diesel table definitions for the sync infrastructure tables.

diesel::table! {
    sync_configs (id) {
        id -> Text,
        name -> Text,
        spreadsheet_id -> Text,
        range -> Text,
        target_table -> Text,
        column_mapping -> Text,
        conflict_policy -> Text,
        interval_secs -> Integer,
        active -> Integer,
    }
}

diesel::table! {
    sync_state (config_id) {
        config_id -> Text,
        last_sheet_sync_at -> Nullable<Text>,
        last_db_sync_at -> Nullable<Text>,
        sheet_etag -> Nullable<Text>,
        db_last_change_id -> BigInt,
        updated_at -> Text,
    }
}

diesel::table! {
    sync_runs (id) {
        id -> Text,
        config_id -> Text,
        direction -> Text,
        status -> Text,
        started_at -> Text,
        completed_at -> Nullable<Text>,
        rows_affected -> BigInt,
        conflicts_detected -> BigInt,
        error -> Nullable<Text>,
        metadata -> Nullable<Text>,
    }
}

diesel::table! {
    sync_conflicts (id) {
        id -> Text,
        config_id -> Text,
        row_key -> Text,
        sheet_value -> Text,
        table_value -> Text,
        sheet_changed_at -> Nullable<Text>,
        table_changed_at -> Nullable<Text>,
        policy -> Text,
        winner -> Text,
        resolved_value -> Nullable<Text>,
        resolved_at -> Nullable<Text>,
        created_at -> Text,
    }
}

diesel::table! {
    sync_change_log (id) {
        id -> BigInt,
        table_name -> Text,
        op -> Text,
        row_snapshot -> Text,
        source_tag -> Nullable<Text>,
        changed_at -> Text,
        processed -> Integer,
    }
}
