use crate::domain::models::Profile;
use crate::infrastructure::error::InfraError;
use std::sync::Mutex;

/// Ordered local mirror of the profile catalog. Order is meaningful: "first
/// remaining profile" promotion on delete follows catalog order.
pub trait ProfileCacheRepository: Send + Sync {
    fn get_by_id(&self, profile_id: &str) -> Result<Option<Profile>, InfraError>;
    fn upsert(&self, profile: &Profile) -> Result<(), InfraError>;
    fn remove(&self, profile_id: &str) -> Result<(), InfraError>;
    fn list_all(&self) -> Result<Vec<Profile>, InfraError>;
    fn replace_all(&self, profiles: Vec<Profile>) -> Result<(), InfraError>;
}

#[derive(Debug, Default)]
pub struct InMemoryProfileCacheRepository {
    profiles: Mutex<Vec<Profile>>,
}

impl InMemoryProfileCacheRepository {
    fn normalized_id(profile_id: &str) -> Option<String> {
        let normalized = profile_id.trim();
        if normalized.is_empty() {
            return None;
        }
        Some(normalized.to_string())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<Profile>>, InfraError> {
        self.profiles
            .lock()
            .map_err(|error| InfraError::Storage(format!("profile cache lock poisoned: {error}")))
    }
}

impl ProfileCacheRepository for InMemoryProfileCacheRepository {
    fn get_by_id(&self, profile_id: &str) -> Result<Option<Profile>, InfraError> {
        let Some(profile_id) = Self::normalized_id(profile_id) else {
            return Ok(None);
        };
        let profiles = self.lock()?;
        Ok(profiles
            .iter()
            .find(|profile| profile.id == profile_id)
            .cloned())
    }

    fn upsert(&self, profile: &Profile) -> Result<(), InfraError> {
        if Self::normalized_id(&profile.id).is_none() {
            return Err(InfraError::Storage(
                "profile id is required for cache upsert".to_string(),
            ));
        }

        let mut profiles = self.lock()?;
        match profiles.iter_mut().find(|cached| cached.id == profile.id) {
            Some(cached) => *cached = profile.clone(),
            None => profiles.push(profile.clone()),
        }
        Ok(())
    }

    fn remove(&self, profile_id: &str) -> Result<(), InfraError> {
        let Some(profile_id) = Self::normalized_id(profile_id) else {
            return Ok(());
        };
        self.lock()?.retain(|profile| profile.id != profile_id);
        Ok(())
    }

    fn list_all(&self) -> Result<Vec<Profile>, InfraError> {
        Ok(self.lock()?.clone())
    }

    fn replace_all(&self, profiles: Vec<Profile>) -> Result<(), InfraError> {
        *self.lock()? = profiles;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_preserves_catalog_order() {
        let cache = InMemoryProfileCacheRepository::default();
        let first = Profile::local("First", "bell.slash");
        let second = Profile::local("Second", "bell.slash");
        cache.upsert(&first).expect("upsert first");
        cache.upsert(&second).expect("upsert second");

        let mut renamed = first.clone();
        renamed.name = "Renamed".to_string();
        cache.upsert(&renamed).expect("upsert renamed");

        let all = cache.list_all().expect("list");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "Renamed");
        assert_eq!(all[1].name, "Second");
    }

    #[test]
    fn remove_tolerates_blank_and_missing_ids() {
        let cache = InMemoryProfileCacheRepository::default();
        cache
            .upsert(&Profile::local("Only", "bell.slash"))
            .expect("upsert");
        cache.remove("  ").expect("remove blank");
        cache.remove("missing").expect("remove missing");
        assert_eq!(cache.list_all().expect("list").len(), 1);
    }
}
