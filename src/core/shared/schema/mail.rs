diesel::table! {
    imap_accounts (id) {
        id -> Int8,
        name -> Varchar,
        host -> Varchar,
        port -> Int4,
        username -> Varchar,
        password_encrypted -> Text,
        folder -> Varchar,
        schedule -> Varchar,
        process_unread_only -> Bool,
        mark_as_read -> Bool,
        sync_known_only -> Bool,
        filter_rule -> Nullable<Text>,
        priority -> Int4,
        active -> Bool,
        default_company_id -> Nullable<Int8>,
        module_slug -> Varchar,
        last_synced_at -> Nullable<Timestamptz>,
        scheduled_task_id -> Nullable<Int8>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    imap_messages (id) {
        id -> Int8,
        account_id -> Int8,
        message_uid -> Int8,
        status -> Varchar,
        ticket_id -> Nullable<Int8>,
        error -> Nullable<Text>,
        processed_at -> Timestamptz,
    }
}

diesel::table! {
    scheduled_tasks (id) {
        id -> Int8,
        name -> Varchar,
        task_type -> Varchar,
        cron_expression -> Varchar,
        payload -> Jsonb,
        enabled -> Bool,
        last_run -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::joinable!(imap_messages -> imap_accounts (account_id));
