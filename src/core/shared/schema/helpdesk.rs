diesel::table! {
    tickets (id) {
        id -> Int8,
        subject -> Varchar,
        description -> Nullable<Text>,
        status -> Varchar,
        priority -> Varchar,
        category -> Nullable<Varchar>,
        module_slug -> Nullable<Varchar>,
        company_id -> Nullable<Int8>,
        requester_id -> Nullable<Int8>,
        ticket_number -> Nullable<Varchar>,
        external_reference -> Nullable<Varchar>,
        merged_into_ticket_id -> Nullable<Int8>,
        split_from_ticket_id -> Nullable<Int8>,
        ai_tags -> Array<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        closed_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    ticket_replies (id) {
        id -> Int8,
        ticket_id -> Int8,
        author_id -> Nullable<Int8>,
        body -> Text,
        is_internal -> Bool,
        minutes_spent -> Nullable<Int4>,
        is_billable -> Bool,
        labour_type_id -> Nullable<Int8>,
        external_reference -> Nullable<Varchar>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    ticket_watchers (id) {
        id -> Int8,
        ticket_id -> Int8,
        user_id -> Nullable<Int8>,
        email -> Nullable<Varchar>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    ticket_attachments (id) {
        id -> Int8,
        ticket_id -> Int8,
        reply_id -> Nullable<Int8>,
        filename -> Varchar,
        stored_name -> Varchar,
        content_type -> Varchar,
        size_bytes -> Int8,
        access_level -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(ticket_replies -> tickets (ticket_id));
diesel::joinable!(ticket_watchers -> tickets (ticket_id));
diesel::joinable!(ticket_attachments -> tickets (ticket_id));
