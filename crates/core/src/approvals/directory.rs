use std::collections::BTreeMap;

use crate::domain::user::{CompanyId, User, UserId};

/// Read-only view of the users relevant to one approval decision.
#[derive(Clone, Debug, Default)]
pub struct Directory {
    users: BTreeMap<UserId, User>,
}

impl Directory {
    pub fn new(users: impl IntoIterator<Item = User>) -> Self {
        Self { users: users.into_iter().map(|user| (user.id.clone(), user)).collect() }
    }

    pub fn insert(&mut self, user: User) {
        self.users.insert(user.id.clone(), user);
    }

    pub fn get(&self, id: &UserId) -> Option<&User> {
        self.users.get(id)
    }

    pub fn active_user(&self, id: &UserId, company_id: &CompanyId) -> Option<&User> {
        self.users.get(id).filter(|user| user.is_active && &user.company_id == company_id)
    }

    /// The owner's direct manager, if set, active and in the same company.
    pub fn active_manager_of(&self, owner: &User) -> Option<&User> {
        let manager_id = owner.manager_id.as_ref()?;
        if manager_id == &owner.id {
            return None;
        }
        self.active_user(manager_id, &owner.company_id)
    }

    /// Active admins of the company, ordered by id.
    pub fn active_admins(&self, company_id: &CompanyId) -> Vec<&User> {
        self.users.values().filter(|user| user.is_active_admin_of(company_id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::Directory;
    use crate::approvals::test_support::user;
    use crate::domain::user::{CompanyId, UserRole};

    #[test]
    fn inactive_manager_is_not_resolved() {
        let mut manager = user("u-mgr", UserRole::Manager, None);
        manager.is_active = false;
        let employee = user("u-emp", UserRole::Employee, Some("u-mgr"));
        let directory = Directory::new([manager, employee.clone()]);

        assert!(directory.active_manager_of(&employee).is_none());
    }

    #[test]
    fn admins_are_scoped_to_company_and_active_flag() {
        let mut retired = user("u-old-admin", UserRole::Admin, None);
        retired.is_active = false;
        let mut foreign = user("u-foreign", UserRole::Admin, None);
        foreign.company_id = CompanyId("c-2".to_string());
        let directory =
            Directory::new([user("u-admin", UserRole::Admin, None), retired, foreign]);

        let admins = directory.active_admins(&CompanyId("c-1".to_string()));
        assert_eq!(admins.len(), 1);
        assert_eq!(admins[0].id.0, "u-admin");
    }
}
