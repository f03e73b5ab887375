diesel::table! {
    automations (id) {
        id -> Int8,
        name -> Varchar,
        trigger_event -> Varchar,
        enabled -> Bool,
        condition -> Nullable<Text>,
        action_module -> Varchar,
        action_payload -> Jsonb,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    integration_modules (id) {
        id -> Int8,
        slug -> Varchar,
        name -> Varchar,
        enabled -> Bool,
        settings -> Jsonb,
    }
}

diesel::table! {
    message_templates (id) {
        id -> Int8,
        slug -> Varchar,
        name -> Varchar,
        content -> Text,
        content_type -> Varchar,
    }
}

diesel::table! {
    assets (id) {
        id -> Int8,
        name -> Varchar,
        company_id -> Nullable<Int8>,
        is_active -> Bool,
        last_seen_at -> Nullable<Timestamptz>,
        custom_fields -> Jsonb,
    }
}

diesel::table! {
    issue_assignments (id) {
        id -> Int8,
        issue_slug -> Varchar,
        asset_id -> Int8,
    }
}

diesel::joinable!(issue_assignments -> assets (asset_id));
