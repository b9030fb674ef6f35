use std::sync::Arc;

use serde_json::json;

use libraryservice_store::data_store::DataStore;

use crate::api::{AdminId, AdminRegistration, AdminRole, AdminUser, ADMIN_USERS_COLLECTION};
use crate::clock::Clock;
use crate::documents::{fields, from_document, to_document};
use crate::error::{require_non_blank, DomainError};

/// Profiles of the operators recording loans
pub struct AdminProfileService {
    store: Arc<dyn DataStore>,
    clock: Arc<dyn Clock>,
}

impl AdminProfileService {
    pub fn new(store: Arc<dyn DataStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// New profiles always get the `admin` role
    pub async fn register(&self, registration: AdminRegistration) -> Result<AdminUser, DomainError> {
        let admin = AdminUser {
            id: uuid::Uuid::new_v4().to_string(),
            email: validate_email(&registration.email)?,
            name: require_non_blank("name", &registration.name)?,
            role: AdminRole::Admin,
            created_at: self.clock.now(),
        };
        self.store
            .set(ADMIN_USERS_COLLECTION, &admin.id, to_document(&admin)?)
            .await?;
        tracing::info!("Registered admin {} <{}>", admin.id, admin.email);
        Ok(admin)
    }

    pub async fn get_profile(&self, admin_id: &str) -> Result<AdminUser, DomainError> {
        self.store
            .get(ADMIN_USERS_COLLECTION, admin_id)
            .await?
            .map(from_document)
            .transpose()?
            .ok_or_else(|| DomainError::NotFound(format!("Admin {admin_id}")))
    }

    pub async fn rename(&self, admin_id: &AdminId, name: &str) -> Result<AdminUser, DomainError> {
        let name = require_non_blank("name", name)?;
        self.store
            .update(ADMIN_USERS_COLLECTION, admin_id, fields([("name", json!(name))]))
            .await
            .map_err(|err| match DomainError::from(err) {
                DomainError::NotFound(_) => DomainError::NotFound(format!("Admin {admin_id}")),
                other => other,
            })?;
        self.get_profile(admin_id).await
    }
}

fn validate_email(email: &str) -> Result<String, DomainError> {
    let email = require_non_blank("email", email)?;
    let well_formed = email
        .split_once('@')
        .map(|(local, domain)| {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        })
        .unwrap_or_default();
    if well_formed && !email.contains(char::is_whitespace) {
        Ok(email)
    } else {
        Err(DomainError::Validation(format!("{email} is not a valid email")))
    }
}

#[cfg(test)]
mod admin_profile_tests {
    use libraryservice_store::data_store::InMemoryDataStore;

    use crate::clock::ManualClock;

    use super::*;

    fn service() -> AdminProfileService {
        AdminProfileService::new(
            Arc::new(InMemoryDataStore::default()),
            Arc::new(ManualClock::new(5_000)),
        )
    }

    #[test]
    fn email_format() {
        assert_eq!(validate_email(" ann@library.id ").unwrap(), "ann@library.id");
        for invalid in ["", "ann", "@library.id", "ann@library", "ann@.id", "a nn@library.id"] {
            assert!(
                matches!(validate_email(invalid), Err(DomainError::Validation(..))),
                "{invalid} accepted"
            );
        }
    }

    #[tokio::test]
    /// Covers admin profile
    /// 1. Registers an admin with default role
    /// 2. Reads the profile back
    /// 3. Renames it, rejecting a blank name
    /// 4. Unknown profiles are not found
    async fn test_admin_profile() {
        let profiles = service();

        let admin = profiles
            .register(AdminRegistration {
                email: "ann@library.id".to_string(),
                name: " Ann ".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(admin.name, "Ann");
        assert_eq!(admin.role, AdminRole::Admin);
        assert_eq!(admin.created_at, 5_000);

        assert_eq!(profiles.get_profile(&admin.id).await.unwrap(), admin);

        let renamed = profiles.rename(&admin.id, "Ann Smith").await.unwrap();
        assert_eq!(renamed.name, "Ann Smith");
        assert_eq!(renamed.email, admin.email);

        let blank = profiles.rename(&admin.id, " ").await;
        assert!(matches!(blank, Err(DomainError::Validation(..))));

        let unknown = profiles.rename(&"nobody".to_string(), "Bob").await;
        assert!(matches!(unknown, Err(DomainError::NotFound(..))));
        assert!(matches!(
            profiles.get_profile("nobody").await,
            Err(DomainError::NotFound(..))
        ));
    }
}
