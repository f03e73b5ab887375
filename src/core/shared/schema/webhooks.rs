diesel::table! {
    webhook_events (id) {
        id -> Int8,
        name -> Varchar,
        direction -> Varchar,
        target_url -> Nullable<Text>,
        source_url -> Nullable<Text>,
        headers -> Jsonb,
        payload -> Jsonb,
        attempt_count -> Int4,
        max_attempts -> Int4,
        backoff_seconds -> Int4,
        status -> Varchar,
        next_attempt_at -> Nullable<Timestamptz>,
        last_error -> Nullable<Text>,
        response_status -> Nullable<Int4>,
        response_body -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    webhook_attempts (id) {
        id -> Int8,
        event_id -> Int8,
        attempt_number -> Int4,
        status -> Varchar,
        response_status -> Nullable<Int4>,
        response_body -> Nullable<Text>,
        error_message -> Nullable<Text>,
        request_headers -> Jsonb,
        request_body -> Nullable<Text>,
        response_headers -> Jsonb,
        attempted_at -> Timestamptz,
    }
}

diesel::joinable!(webhook_attempts -> webhook_events (event_id));
