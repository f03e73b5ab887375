use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard};

use super::models::{Company, StaffMember, User};
use crate::core::error::{CoreError, CoreResult};

/// Read-only view over users, companies and company staff.
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    async fn user(&self, id: i64) -> CoreResult<Option<User>>;

    /// Case-insensitive match on the email address.
    async fn user_by_email(&self, email: &str) -> CoreResult<Option<User>>;

    async fn company(&self, id: i64) -> CoreResult<Option<Company>>;

    async fn company_by_domain(&self, domain: &str) -> CoreResult<Option<Company>>;

    async fn staff_by_email(&self, company_id: i64, email: &str) -> CoreResult<Option<StaffMember>>;

    /// Present in users or in any company's staff list.
    async fn is_known_sender(&self, email: &str) -> CoreResult<bool>;
}

#[derive(Default)]
struct Contacts {
    users: Vec<User>,
    companies: Vec<Company>,
    staff: Vec<StaffMember>,
}

#[derive(Default)]
pub struct MemoryContactDirectory {
    contacts: Mutex<Contacts>,
}

impl MemoryContactDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> CoreResult<MutexGuard<'_, Contacts>> {
        self.contacts
            .lock()
            .map_err(|_| CoreError::internal("Contact directory lock poisoned"))
    }

    pub fn add_company(&self, name: &str, email_domain: Option<&str>) -> CoreResult<i64> {
        let mut contacts = self.lock()?;
        let id = contacts.companies.len() as i64 + 1;
        contacts.companies.push(Company {
            id,
            name: name.to_string(),
            email_domain: email_domain.map(str::to_string),
        });
        Ok(id)
    }

    pub fn add_user(&self, email: &str, name: Option<&str>, company_id: Option<i64>) -> CoreResult<i64> {
        let mut contacts = self.lock()?;
        let id = contacts.users.len() as i64 + 1;
        contacts.users.push(User {
            id,
            email: email.to_string(),
            name: name.map(str::to_string),
            company_id,
            is_active: true,
        });
        Ok(id)
    }

    pub fn add_staff(&self, company_id: i64, email: &str, user_id: Option<i64>) -> CoreResult<i64> {
        let mut contacts = self.lock()?;
        let id = contacts.staff.len() as i64 + 1;
        contacts.staff.push(StaffMember {
            id,
            company_id,
            user_id,
            email: email.to_string(),
            name: None,
        });
        Ok(id)
    }
}

#[async_trait]
impl ContactDirectory for MemoryContactDirectory {
    async fn user(&self, id: i64) -> CoreResult<Option<User>> {
        Ok(self.lock()?.users.iter().find(|u| u.id == id).cloned())
    }

    async fn user_by_email(&self, email: &str) -> CoreResult<Option<User>> {
        Ok(self
            .lock()?
            .users
            .iter()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn company(&self, id: i64) -> CoreResult<Option<Company>> {
        Ok(self.lock()?.companies.iter().find(|c| c.id == id).cloned())
    }

    async fn company_by_domain(&self, domain: &str) -> CoreResult<Option<Company>> {
        Ok(self
            .lock()?
            .companies
            .iter()
            .find(|c| {
                c.email_domain
                    .as_deref()
                    .is_some_and(|d| d.eq_ignore_ascii_case(domain))
            })
            .cloned())
    }

    async fn staff_by_email(&self, company_id: i64, email: &str) -> CoreResult<Option<StaffMember>> {
        Ok(self
            .lock()?
            .staff
            .iter()
            .find(|s| s.company_id == company_id && s.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn is_known_sender(&self, email: &str) -> CoreResult<bool> {
        let contacts = self.lock()?;
        Ok(contacts.users.iter().any(|u| u.email.eq_ignore_ascii_case(email))
            || contacts.staff.iter().any(|s| s.email.eq_ignore_ascii_case(email)))
    }
}
