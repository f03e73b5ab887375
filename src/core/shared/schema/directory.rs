diesel::table! {
    users (id) {
        id -> Int8,
        email -> Varchar,
        name -> Nullable<Varchar>,
        company_id -> Nullable<Int8>,
        is_active -> Bool,
    }
}

diesel::table! {
    companies (id) {
        id -> Int8,
        name -> Varchar,
        email_domain -> Nullable<Varchar>,
    }
}

diesel::table! {
    company_staff (id) {
        id -> Int8,
        company_id -> Int8,
        user_id -> Nullable<Int8>,
        email -> Varchar,
        name -> Nullable<Varchar>,
    }
}
