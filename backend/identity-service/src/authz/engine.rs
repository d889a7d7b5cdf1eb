/// Role-based authorization with per-principal overrides and clearance gating
///
/// ## Evaluation order
///
/// 1. Missing principal → `MissingPrincipal`
/// 2. Inactive principal → `UserInactive`
/// 3. Role absent from the table → `UnknownRole` (configuration error)
/// 4. Allowed when an applicable role rule OR an explicit override grants the
///    action; overrides only ever add
/// 5. Clearance, when required, is checked only after 4 allowed
use crate::error::{IdentityError, Result};
use crate::models::{Action, PermissionGrant, Principal, Resource, Role, SecurityClearance};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};
use tracing::error;

/// One role rule: which actions a role may take on a resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRule {
    pub resource: Resource,
    pub actions: BTreeSet<Action>,
    /// Rule applies only to principals cleared at least this high
    pub min_clearance: Option<SecurityClearance>,
    /// Rule applies only to principals in this department
    pub department: Option<String>,
}

impl AccessRule {
    pub fn new(resource: Resource, actions: impl IntoIterator<Item = Action>) -> Self {
        Self {
            resource,
            actions: actions.into_iter().collect(),
            min_clearance: None,
            department: None,
        }
    }

    pub fn with_min_clearance(mut self, clearance: SecurityClearance) -> Self {
        self.min_clearance = Some(clearance);
        self
    }

    pub fn with_department(mut self, department: impl Into<String>) -> Self {
        self.department = Some(department.into());
        self
    }

    fn applies_to(&self, principal: &Principal) -> bool {
        let cleared = self
            .min_clearance
            .map_or(true, |min| principal.security_clearance.satisfies(min));
        let in_department = self
            .department
            .as_deref()
            .map_or(true, |dept| dept.eq_ignore_ascii_case(&principal.department));
        cleared && in_department
    }

    fn grants(&self, resource: Resource, action: Action) -> bool {
        self.resource == resource && self.actions.contains(&action)
    }
}

/// Role → rules table, owned by whoever constructs the engine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RolePermissionTable {
    rules: HashMap<Role, Vec<AccessRule>>,
}

impl RolePermissionTable {
    /// A table with no roles at all
    pub fn empty() -> Self {
        Self::default()
    }

    /// The stock table for the five built-in roles
    pub fn with_defaults() -> Self {
        use Action::*;
        use Resource::*;

        let mut table = Self::empty();
        table.set_role(
            Role::Admin,
            Resource::ALL
                .into_iter()
                .map(|resource| AccessRule::new(resource, Action::ALL))
                .collect(),
        );
        table.set_role(
            Role::Analyst,
            vec![
                AccessRule::new(Documents, [Read, Write]),
                AccessRule::new(Consultations, [Read, Write]),
                AccessRule::new(Knowledge, [Read, Write]),
                AccessRule::new(Audit, [Read]),
            ],
        );
        table.set_role(
            Role::Manager,
            vec![
                AccessRule::new(Documents, [Read, Write, Delete]),
                AccessRule::new(Consultations, [Read, Write, Delete]),
                AccessRule::new(Users, [Read]),
                AccessRule::new(Knowledge, [Read, Write, Delete]),
                AccessRule::new(Audit, [Read, Write]),
            ],
        );
        table.set_role(
            Role::Consultant,
            vec![
                AccessRule::new(Documents, [Read]),
                AccessRule::new(Consultations, [Read, Write]),
                AccessRule::new(Knowledge, [Read, Write]),
                AccessRule::new(Audit, [Read]),
            ],
        );
        table.set_role(
            Role::Viewer,
            vec![
                AccessRule::new(Documents, [Read]),
                AccessRule::new(Consultations, [Read]),
                AccessRule::new(Knowledge, [Read]),
            ],
        );
        table
    }

    pub fn set_role(&mut self, role: Role, rules: Vec<AccessRule>) {
        self.rules.insert(role, rules);
    }

    pub fn rules(&self, role: Role) -> Option<&[AccessRule]> {
        self.rules.get(&role).map(Vec::as_slice)
    }

    /// Merge actions into the role's unrestricted rule for `resource`
    pub fn add_permission(&mut self, role: Role, resource: Resource, actions: &[Action]) {
        let rules = self.rules.entry(role).or_default();
        match rules
            .iter_mut()
            .find(|rule| rule.resource == resource && rule.min_clearance.is_none() && rule.department.is_none())
        {
            Some(rule) => rule.actions.extend(actions.iter().copied()),
            None => rules.push(AccessRule::new(resource, actions.iter().copied())),
        }
    }

    /// Remove actions from every rule the role has for `resource`
    ///
    /// A rule left with no actions is dropped. Returns whether anything changed.
    pub fn remove_permission(&mut self, role: Role, resource: Resource, actions: &[Action]) -> bool {
        let Some(rules) = self.rules.get_mut(&role) else {
            return false;
        };

        let mut changed = false;
        for rule in rules.iter_mut().filter(|rule| rule.resource == resource) {
            for action in actions {
                changed |= rule.actions.remove(action);
            }
        }
        rules.retain(|rule| !rule.actions.is_empty());
        changed
    }
}

/// Authorization engine
///
/// Reads take a shared lock; administrative mutations build the new table
/// aside and swap it in, so concurrent readers see either the old or the new
/// table in full.
#[derive(Debug)]
pub struct AuthorizationEngine {
    table: RwLock<RolePermissionTable>,
}

impl Default for AuthorizationEngine {
    fn default() -> Self {
        Self::new(RolePermissionTable::with_defaults())
    }
}

impl AuthorizationEngine {
    pub fn new(table: RolePermissionTable) -> Self {
        Self {
            table: RwLock::new(table),
        }
    }

    fn read_table<T>(&self, f: impl FnOnce(&RolePermissionTable) -> T) -> T {
        let guard = self.table.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    fn mutate_table<T>(&self, f: impl FnOnce(&mut RolePermissionTable) -> T) -> T {
        let mut guard = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = guard.clone();
        let result = f(&mut next);
        *guard = next;
        result
    }

    /// Resolve an evaluable principal and the rules applying to it
    fn applicable_rules<'a>(
        &self,
        principal: Option<&'a Principal>,
    ) -> Result<(&'a Principal, Vec<AccessRule>)> {
        let principal = principal.ok_or(IdentityError::MissingPrincipal)?;
        if !principal.is_active {
            return Err(IdentityError::UserInactive);
        }

        let rules = self.read_table(|table| table.rules(principal.role).map(<[AccessRule]>::to_vec));
        let Some(rules) = rules else {
            error!(
                user_id = %principal.id,
                role = %principal.role,
                "Role missing from permission table"
            );
            return Err(IdentityError::UnknownRole(principal.role.to_string()));
        };

        let applicable = rules
            .into_iter()
            .filter(|rule| rule.applies_to(principal))
            .collect();
        Ok((principal, applicable))
    }

    /// May `principal` perform `action` on `resource`?
    ///
    /// `Ok(false)` is a plain denial; errors are reserved for a missing or
    /// inactive principal and an unknown role.
    pub fn authorize(&self, principal: Option<&Principal>, resource: Resource, action: Action) -> Result<bool> {
        let (principal, rules) = self.applicable_rules(principal)?;

        let by_role = rules.iter().any(|rule| rule.grants(resource, action));
        let by_override = principal.override_allows(resource, action);

        Ok(by_role || by_override)
    }

    /// [`authorize`](Self::authorize) followed by a clearance check
    ///
    /// Insufficient clearance on an otherwise allowed request is
    /// `InsufficientClearance`, never a plain denial.
    pub fn authorize_with_clearance(
        &self,
        principal: Option<&Principal>,
        resource: Resource,
        action: Action,
        required: Option<SecurityClearance>,
    ) -> Result<bool> {
        if !self.authorize(principal, resource, action)? {
            return Ok(false);
        }

        if let (Some(required), Some(principal)) = (required, principal) {
            if !principal.security_clearance.satisfies(required) {
                return Err(IdentityError::InsufficientClearance {
                    required: required.to_string(),
                    actual: principal.security_clearance.to_string(),
                });
            }
        }
        Ok(true)
    }

    /// Like [`authorize`](Self::authorize), turning a denial into `InsufficientPermissions`
    pub fn require(&self, principal: Option<&Principal>, resource: Resource, action: Action) -> Result<()> {
        if self.authorize(principal, resource, action)? {
            Ok(())
        } else {
            Err(IdentityError::InsufficientPermissions {
                resource: resource.to_string(),
                action: action.to_string(),
            })
        }
    }

    /// Merged view of role rules and overrides, one grant per resource
    pub fn user_permissions(&self, principal: Option<&Principal>) -> Result<Vec<PermissionGrant>> {
        let (principal, rules) = self.applicable_rules(principal)?;

        let mut merged: BTreeMap<Resource, BTreeSet<Action>> = BTreeMap::new();
        for rule in &rules {
            merged
                .entry(rule.resource)
                .or_default()
                .extend(rule.actions.iter().copied());
        }
        for grant in &principal.permissions {
            merged
                .entry(grant.resource)
                .or_default()
                .extend(grant.actions.iter().copied());
        }

        Ok(merged
            .into_iter()
            .filter(|(_, actions)| !actions.is_empty())
            .map(|(resource, actions)| PermissionGrant { resource, actions })
            .collect())
    }

    /// `resource:action` strings, as embedded in tokens and sessions
    pub fn flattened_permissions(&self, principal: Option<&Principal>) -> Result<Vec<String>> {
        Ok(self
            .user_permissions(principal)?
            .iter()
            .flat_map(|grant| {
                grant
                    .actions
                    .iter()
                    .map(move |action| format!("{}:{}", grant.resource, action))
            })
            .collect())
    }

    /// Copy of the rules for a role
    pub fn role_permissions(&self, role: Role) -> Result<Vec<AccessRule>> {
        self.read_table(|table| table.rules(role).map(<[AccessRule]>::to_vec))
            .ok_or_else(|| IdentityError::UnknownRole(role.to_string()))
    }

    pub fn add_role_permission(&self, role: Role, resource: Resource, actions: &[Action]) {
        self.mutate_table(|table| table.add_permission(role, resource, actions));
    }

    pub fn remove_role_permission(&self, role: Role, resource: Resource, actions: &[Action]) -> bool {
        self.mutate_table(|table| table.remove_permission(role, resource, actions))
    }

    /// Copy of the whole table
    pub fn snapshot(&self) -> RolePermissionTable {
        self.read_table(Clone::clone)
    }

    /// Document access gated by the document's classification
    pub fn can_access_document(
        &self,
        principal: Option<&Principal>,
        classification: SecurityClearance,
        action: Action,
    ) -> Result<bool> {
        self.authorize_with_clearance(principal, Resource::Documents, action, Some(classification))
    }

    /// Authorize against a resource id such as `doc_123` or `consult_9`
    pub fn check_resource_access(
        &self,
        principal: Option<&Principal>,
        resource_id: &str,
        action: Action,
    ) -> Result<bool> {
        let resource = resource_from_id(resource_id)?;
        self.authorize(principal, resource, action)
    }
}

/// Map a resource id to its resource family by prefix
pub fn resource_from_id(resource_id: &str) -> Result<Resource> {
    const PREFIXES: [(&str, Resource); 4] = [
        ("doc_", Resource::Documents),
        ("consult_", Resource::Consultations),
        ("user_", Resource::Users),
        ("knowledge_", Resource::Knowledge),
    ];

    PREFIXES
        .iter()
        .find(|(prefix, _)| resource_id.starts_with(prefix))
        .map(|(_, resource)| *resource)
        .ok_or_else(|| {
            IdentityError::Validation(format!("unrecognised resource id '{resource_id}'"))
        })
}
