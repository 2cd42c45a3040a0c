//! Role, grant and role-grant graph.
//!
//! Entries are inserted unvalidated (except those granted by the root
//! identity) and [`PrivilegeGraph::validate_and_process`] computes, as a
//! fixpoint, which of them are authorized. Role closures are memoized per
//! validation generation: every flip of a role grant bumps the generation, and
//! a closure is recomputed lazily the next time it is asked for.

pub mod descriptor;

pub use descriptor::{Grantability, PrivilegeDescriptor, PrivilegeKind};

use crate::catalog::types::{ObjectId, RoleId, SchemaId, UpperName};
use crate::error::{Result, TxnError};
use std::borrow::Cow;
use std::collections::BTreeMap;
use tracing::warn;

/// The root identity. Everything it grants is valid and it holds every
/// privilege.
pub const ROOT_ROLE: RoleId = 1;
pub const ROOT_ROLE_NAME: &str = "_SYSTEM";
pub const PUBLIC_ROLE: RoleId = 2;
pub const PUBLIC_ROLE_NAME: &str = "PUBLIC";

/// Roles reachable from a role, each flagged with whether it is held with
/// admin option.
pub type RoleClosure = BTreeMap<RoleId, bool>;

#[derive(Debug, Clone)]
pub struct RoleDef {
    pub role_id: RoleId,
    pub name: UpperName,
    pub schema: Option<SchemaId>,
    /// Valid role grants held directly: granted role -> with admin.
    direct: BTreeMap<RoleId, bool>,
    contained_cache: Option<(u64, RoleClosure)>,
    applicable_cache: Option<(u64, RoleClosure)>,
}

impl RoleDef {
    fn new(role_id: RoleId, name: UpperName, schema: Option<SchemaId>) -> Self {
        Self {
            role_id,
            name,
            schema,
            direct: BTreeMap::new(),
            contained_cache: None,
            applicable_cache: None,
        }
    }

    pub fn direct_roles(&self) -> &BTreeMap<RoleId, bool> {
        &self.direct
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantDef {
    pub grantor: RoleId,
    pub grantee: RoleId,
    pub object: ObjectId,
    pub privileges: PrivilegeDescriptor,
    pub valid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleGrantDef {
    pub grantor: RoleId,
    pub grantee: RoleId,
    pub role: RoleId,
    pub with_admin: bool,
    pub valid: bool,
}

/// `(grantee, object, grantor)`
pub type GrantKey = (RoleId, ObjectId, RoleId);
/// `(grantee, role, grantor)`
pub type RoleGrantKey = (RoleId, RoleId, RoleId);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    /// Grantee, grantor, role or object does not exist.
    Dangling,
    /// The grantor lacks admin option or grant option.
    Unauthorized,
    /// Accepting the grant would make a role contain itself.
    Cycle,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub invalid_role_grants: Vec<(RoleGrantKey, InvalidReason)>,
    pub invalid_grants: Vec<(GrantKey, InvalidReason)>,
    pub cyclic_roles: Vec<RoleId>,
    pub passes: usize,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.invalid_role_grants.is_empty()
            && self.invalid_grants.is_empty()
            && self.cyclic_roles.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PrivilegeGraph {
    roles: BTreeMap<RoleId, RoleDef>,
    role_names: BTreeMap<UpperName, RoleId>,
    grants: BTreeMap<GrantKey, GrantDef>,
    role_grants: BTreeMap<RoleGrantKey, RoleGrantDef>,
    /// Every live object and its parent, for ancestor privilege merging.
    objects: BTreeMap<ObjectId, Option<ObjectId>>,
    generation: u64,
}

impl PrivilegeGraph {
    pub fn new() -> Self {
        let mut graph = Self::default();
        graph.add_role(ROOT_ROLE, ROOT_ROLE_NAME, None);
        graph.add_role(PUBLIC_ROLE, PUBLIC_ROLE_NAME, None);
        graph
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn add_role(&mut self, role_id: RoleId, name: &str, schema: Option<SchemaId>) {
        let name = UpperName::new(name);
        if let Some(existing) = self.roles.get_mut(&role_id) {
            self.role_names.remove(&existing.name);
            existing.name = name.clone();
            existing.schema = schema;
        } else {
            self.roles
                .insert(role_id, RoleDef::new(role_id, name.clone(), schema));
        }
        self.role_names.insert(name, role_id);
    }

    pub fn register_object(&mut self, object: ObjectId, parent: Option<ObjectId>) {
        self.objects.insert(object, parent);
    }

    /// Inserts or merges the grant keyed by `(grantee, object, grantor)`.
    pub fn add_grant(
        &mut self,
        grantor: RoleId,
        grantee: RoleId,
        object: ObjectId,
        privileges: PrivilegeDescriptor,
    ) {
        let entry = self
            .grants
            .entry((grantee, object, grantor))
            .or_insert_with(|| GrantDef {
                grantor,
                grantee,
                object,
                privileges: PrivilegeDescriptor::empty(),
                valid: false,
            });
        entry.privileges.merge(&privileges);
        entry.valid = grantor == ROOT_ROLE;
    }

    /// Inserts or merges the role grant keyed by `(grantee, role, grantor)`.
    pub fn add_role_grant(&mut self, grantor: RoleId, grantee: RoleId, role: RoleId, with_admin: bool) {
        let entry = self
            .role_grants
            .entry((grantee, role, grantor))
            .or_insert_with(|| RoleGrantDef {
                grantor,
                grantee,
                role,
                with_admin: false,
                valid: false,
            });
        entry.with_admin |= with_admin;
        entry.valid = grantor == ROOT_ROLE;
    }

    pub fn role(&self, role_id: RoleId) -> Option<&RoleDef> {
        self.roles.get(&role_id)
    }

    pub fn role_by_name(&self, name: &str) -> Option<&RoleDef> {
        self.role_names
            .get(&UpperName::new(name))
            .and_then(|id| self.roles.get(id))
    }

    pub fn roles(&self) -> impl Iterator<Item = &RoleDef> {
        self.roles.values()
    }

    pub fn grants(&self) -> impl Iterator<Item = &GrantDef> {
        self.grants.values()
    }

    pub fn role_grants(&self) -> impl Iterator<Item = &RoleGrantDef> {
        self.role_grants.values()
    }

    pub fn grant(&self, key: &GrantKey) -> Option<&GrantDef> {
        self.grants.get(key)
    }

    pub fn role_grant(&self, key: &RoleGrantKey) -> Option<&RoleGrantDef> {
        self.role_grants.get(key)
    }

    /// Grants left invalid by the last validation.
    pub fn abandoned_grants(&self) -> impl Iterator<Item = &GrantDef> {
        self.grants.values().filter(|g| !g.valid)
    }

    pub fn abandoned_role_grants(&self) -> impl Iterator<Item = &RoleGrantDef> {
        self.role_grants.values().filter(|g| !g.valid)
    }

    fn compute_contained(&self, role: RoleId) -> RoleClosure {
        let mut out = RoleClosure::new();
        let mut stack = vec![role];
        while let Some(current) = stack.pop() {
            let Some(def) = self.roles.get(&current) else {
                continue;
            };
            for (&granted, &admin) in &def.direct {
                match out.get_mut(&granted) {
                    Some(flag) => *flag |= admin,
                    None => {
                        out.insert(granted, admin);
                        stack.push(granted);
                    }
                }
            }
        }
        out
    }

    fn compute_applicable(&self, role: RoleId, contained: &RoleClosure) -> RoleClosure {
        let mut out = contained.clone();
        if role != PUBLIC_ROLE {
            out.entry(PUBLIC_ROLE).or_insert(false);
            for (granted, admin) in self.contained_roles(PUBLIC_ROLE).iter() {
                *out.entry(*granted).or_insert(false) |= *admin;
            }
        }
        out
    }

    /// Roles directly or transitively granted to `role`. Uses the memoized
    /// closure when it is current.
    pub fn contained_roles(&self, role: RoleId) -> Cow<'_, RoleClosure> {
        if let Some(def) = self.roles.get(&role)
            && let Some((generation, closure)) = &def.contained_cache
            && *generation == self.generation
        {
            return Cow::Borrowed(closure);
        }
        Cow::Owned(self.compute_contained(role))
    }

    /// Contained roles plus PUBLIC and everything PUBLIC contains.
    pub fn applicable_roles(&self, role: RoleId) -> Cow<'_, RoleClosure> {
        if let Some(def) = self.roles.get(&role)
            && let Some((generation, closure)) = &def.applicable_cache
            && *generation == self.generation
        {
            return Cow::Borrowed(closure);
        }
        let contained = self.contained_roles(role);
        Cow::Owned(self.compute_applicable(role, &contained))
    }

    fn memo_contained(&mut self, role: RoleId) -> RoleClosure {
        let generation = self.generation;
        if let Some(def) = self.roles.get(&role)
            && let Some((cached_gen, closure)) = &def.contained_cache
            && *cached_gen == generation
        {
            return closure.clone();
        }
        let closure = self.compute_contained(role);
        if let Some(def) = self.roles.get_mut(&role) {
            def.contained_cache = Some((generation, closure.clone()));
        }
        closure
    }

    fn memo_applicable(&mut self, role: RoleId) -> RoleClosure {
        let generation = self.generation;
        if let Some(def) = self.roles.get(&role)
            && let Some((cached_gen, closure)) = &def.applicable_cache
            && *cached_gen == generation
        {
            return closure.clone();
        }
        let contained = self.memo_contained(role);
        if role != PUBLIC_ROLE {
            self.memo_contained(PUBLIC_ROLE);
        }
        let closure = self.compute_applicable(role, &contained);
        if let Some(def) = self.roles.get_mut(&role) {
            def.applicable_cache = Some((generation, closure.clone()));
        }
        closure
    }

    /// Whether granting `role` to `grantee` would make a role contain itself.
    pub fn would_close_cycle(&self, grantee: RoleId, role: RoleId) -> bool {
        role == grantee || self.contained_roles(role).contains_key(&grantee)
    }

    pub fn is_role_grantable_by(&self, role: RoleId, grantor: RoleId) -> bool {
        grantor == role
            || grantor == ROOT_ROLE
            || self.applicable_roles(grantor).get(&role) == Some(&true)
    }

    fn object_chain(&self, object: ObjectId) -> Vec<ObjectId> {
        let mut chain = vec![object];
        let mut current = object;
        while let Some(Some(parent)) = self.objects.get(&current) {
            if chain.contains(parent) {
                break;
            }
            chain.push(*parent);
            current = *parent;
        }
        chain
    }

    fn collect_privileges(
        &self,
        roles: impl Iterator<Item = RoleId>,
        object: ObjectId,
    ) -> PrivilegeDescriptor {
        let chain = self.object_chain(object);
        let mut out = PrivilegeDescriptor::empty();
        for role in roles {
            for target in &chain {
                for (_, grant) in self
                    .grants
                    .range((role, *target, RoleId::MIN)..=(role, *target, RoleId::MAX))
                {
                    if grant.valid {
                        out.merge(&grant.privileges);
                    }
                }
            }
        }
        out
    }

    /// Privileges `role` holds on `object`, merging grants on the object and
    /// its ancestors to the role, its applicable roles and PUBLIC.
    pub fn get_privileges_for_object(&self, role: RoleId, object: ObjectId) -> PrivilegeDescriptor {
        if role == ROOT_ROLE {
            return PrivilegeDescriptor::all(Grantability::WithGrantOption);
        }
        let applicable = self.applicable_roles(role);
        let roles = std::iter::once(role)
            .chain(std::iter::once(PUBLIC_ROLE))
            .chain(applicable.keys().copied().filter(|r| *r != role && *r != PUBLIC_ROLE));
        self.collect_privileges(roles, object)
    }

    fn memo_privileges_for_object(&mut self, role: RoleId, object: ObjectId) -> PrivilegeDescriptor {
        if role == ROOT_ROLE {
            return PrivilegeDescriptor::all(Grantability::WithGrantOption);
        }
        let applicable = self.memo_applicable(role);
        let roles = std::iter::once(role)
            .chain(std::iter::once(PUBLIC_ROLE))
            .chain(applicable.keys().copied().filter(|r| *r != role && *r != PUBLIC_ROLE));
        self.collect_privileges(roles, object)
    }

    fn record_direct_grant(&mut self, grantee: RoleId, role: RoleId, with_admin: bool) {
        if let Some(def) = self.roles.get_mut(&grantee) {
            *def.direct.entry(role).or_insert(false) |= with_admin;
        }
        self.generation += 1;
    }

    fn reset(&mut self) {
        for def in self.roles.values_mut() {
            def.direct.clear();
            def.contained_cache = None;
            def.applicable_cache = None;
        }
        for grant in self.role_grants.values_mut() {
            grant.valid = false;
        }
        for grant in self.grants.values_mut() {
            grant.valid = grant.grantor == ROOT_ROLE;
        }
        self.generation += 1;
    }

    fn role_grant_reason(&self, grant: &RoleGrantDef) -> InvalidReason {
        let exists = |r: RoleId| self.roles.contains_key(&r);
        if !exists(grant.grantor) || !exists(grant.grantee) || !exists(grant.role) {
            InvalidReason::Dangling
        } else if self.would_close_cycle(grant.grantee, grant.role) {
            InvalidReason::Cycle
        } else {
            InvalidReason::Unauthorized
        }
    }

    fn grant_reason(&self, grant: &GrantDef) -> InvalidReason {
        if !self.roles.contains_key(&grant.grantor)
            || !self.roles.contains_key(&grant.grantee)
            || !self.objects.contains_key(&grant.object)
        {
            InvalidReason::Dangling
        } else {
            InvalidReason::Unauthorized
        }
    }

    fn validate_role_grants(&mut self) -> usize {
        let mut passes = 0;
        loop {
            passes += 1;
            let mut progress = false;
            let pending: Vec<RoleGrantKey> = self
                .role_grants
                .iter()
                .filter(|(_, g)| !g.valid)
                .map(|(k, _)| *k)
                .collect();
            for key in pending {
                let Some(grant) = self.role_grants.get(&key).cloned() else {
                    continue;
                };
                if !self.roles.contains_key(&grant.grantee)
                    || !self.roles.contains_key(&grant.role)
                    || !self.roles.contains_key(&grant.grantor)
                {
                    continue;
                }
                let authorized = grant.grantor == ROOT_ROLE
                    || grant.grantor == grant.role
                    || self.memo_applicable(grant.grantor).get(&grant.role) == Some(&true);
                if !authorized || self.would_close_cycle(grant.grantee, grant.role) {
                    continue;
                }
                if let Some(entry) = self.role_grants.get_mut(&key) {
                    entry.valid = true;
                }
                self.record_direct_grant(grant.grantee, grant.role, grant.with_admin);
                progress = true;
            }
            if !progress {
                return passes;
            }
        }
    }

    fn validate_grants(&mut self) -> usize {
        let mut passes = 0;
        loop {
            passes += 1;
            let mut progress = false;
            let pending: Vec<GrantKey> = self
                .grants
                .iter()
                .filter(|(_, g)| !g.valid)
                .map(|(k, _)| *k)
                .collect();
            for key in pending {
                let Some(grant) = self.grants.get(&key).cloned() else {
                    continue;
                };
                if !self.roles.contains_key(&grant.grantee)
                    || !self.roles.contains_key(&grant.grantor)
                    || !self.objects.contains_key(&grant.object)
                {
                    continue;
                }
                let held = self.memo_privileges_for_object(grant.grantor, grant.object);
                if !held.allows_granting(&grant.privileges) {
                    continue;
                }
                if let Some(entry) = self.grants.get_mut(&key) {
                    entry.valid = true;
                }
                progress = true;
            }
            if !progress {
                return passes;
            }
        }
    }

    /// Recomputes validity of every role grant and grant as a fixpoint, then
    /// sweeps all role closures for cycles.
    ///
    /// In tolerant mode invalid entries are left invalid and reported; in
    /// strict mode the first one fails the call with `Constraint` (cycle) or
    /// `MetadataBad` (dangling or unauthorized).
    pub fn validate_and_process(&mut self, tolerant: bool) -> Result<ValidationReport> {
        self.reset();
        let mut report = ValidationReport {
            passes: self.validate_role_grants(),
            ..ValidationReport::default()
        };

        report.invalid_role_grants = self
            .role_grants
            .iter()
            .filter(|(_, g)| !g.valid)
            .map(|(k, g)| (*k, self.role_grant_reason(g)))
            .collect();
        if let Some(((grantee, role, grantor), reason)) = report.invalid_role_grants.first().copied() {
            let message = format!(
                "role grant of role {role} to {grantee} by {grantor} is invalid ({reason:?})"
            );
            if !tolerant {
                return Err(match reason {
                    InvalidReason::Cycle => TxnError::Constraint(message),
                    _ => TxnError::MetadataBad(message),
                });
            }
            for ((grantee, role, grantor), reason) in &report.invalid_role_grants {
                warn!(grantee, role, grantor, reason = ?reason, "role grant left invalid");
            }
        }

        report.passes += self.validate_grants();
        report.invalid_grants = self
            .grants
            .iter()
            .filter(|(_, g)| !g.valid)
            .map(|(k, g)| (*k, self.grant_reason(g)))
            .collect();
        if let Some(((grantee, object, grantor), reason)) = report.invalid_grants.first().copied() {
            if !tolerant {
                return Err(TxnError::MetadataBad(format!(
                    "grant on object {object} to {grantee} by {grantor} is invalid ({reason:?})"
                )));
            }
            for ((grantee, object, grantor), reason) in &report.invalid_grants {
                warn!(grantee, object, grantor, reason = ?reason, "grant left invalid");
            }
        }

        self.generation += 1;
        let role_ids: Vec<RoleId> = self.roles.keys().copied().collect();
        for role in role_ids {
            let contained = self.memo_contained(role);
            self.memo_applicable(role);
            if contained.contains_key(&role) {
                if !tolerant {
                    return Err(TxnError::Constraint(format!(
                        "role {role} is contained in its own closure"
                    )));
                }
                warn!(role, "role grant cycle detected");
                report.cyclic_roles.push(role);
            }
        }
        Ok(report)
    }
}
