// Resource and Resources: the bag algebra
//
// A Resources bag keeps a normalized representation: at most one entry
// per (name, kind, role, reservation, persistence) tuple, with scalar
// values summed, ranges coalesced and sets deduplicated. Normalization
// is idempotent and re-established after every mutation.

use std::fmt;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

use crate::error::{ResourceError, Result};
use crate::value::{Scalar, Value, ValueKind};
use crate::DEFAULT_ROLE;

/// Persistent volume identity attached to a disk resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Persistence {
    /// Volume identifier, unique per slave
    pub id: String,
    /// Path the volume is mounted under inside the container
    pub container_path: String,
}

/// A single named resource quantity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resource {
    /// Resource name (cpus, mem, disk, ports, ...)
    pub name: String,
    /// The quantity
    pub value: Value,
    /// Role this resource is assigned to; "*" means unreserved
    pub role: String,
    /// Principal that dynamically reserved this resource
    pub reservation: Option<String>,
    /// Persistent volume identity, for disk resources
    pub persistence: Option<Persistence>,
}

impl Resource {
    /// An unreserved scalar resource.
    pub fn scalar(name: &str, scalar: Scalar) -> Self {
        Resource {
            name: name.to_string(),
            value: Value::Scalar(scalar),
            role: DEFAULT_ROLE.to_string(),
            reservation: None,
            persistence: None,
        }
    }

    /// An unreserved ranges resource.
    pub fn ranges(name: &str, intervals: Vec<(u64, u64)>) -> Self {
        Resource {
            name: name.to_string(),
            value: Value::Ranges(crate::value::Ranges::new(intervals)),
            role: DEFAULT_ROLE.to_string(),
            reservation: None,
            persistence: None,
        }
    }

    /// Rebind this resource to a role.
    pub fn with_role(mut self, role: &str) -> Self {
        self.role = role.to_string();
        self
    }

    /// Attach a reservation principal.
    pub fn with_reservation(mut self, principal: &str) -> Self {
        self.reservation = Some(principal.to_string());
        self
    }

    /// Attach persistent volume identity.
    pub fn with_persistence(mut self, id: &str, container_path: &str) -> Self {
        self.persistence = Some(Persistence {
            id: id.to_string(),
            container_path: container_path.to_string(),
        });
        self
    }

    /// Whether this resource is unreserved (role "*", no reservation).
    pub fn is_unreserved(&self) -> bool {
        self.role == DEFAULT_ROLE && self.reservation.is_none()
    }

    /// Whether this resource carries a persistent volume.
    pub fn is_persistent(&self) -> bool {
        self.persistence.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// Whether two resources belong to the same algebra tuple and can
    /// therefore be added or subtracted.
    pub fn matches(&self, other: &Resource) -> bool {
        self.name == other.name
            && self.value.kind() == other.value.kind()
            && self.role == other.role
            && self.reservation == other.reservation
            && self.persistence == other.persistence
    }

    /// Well-formedness check for a single resource.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ResourceError::Invalid("resource has an empty name".to_string()));
        }
        if self.role.is_empty() {
            return Err(ResourceError::Invalid(format!(
                "resource {} has an empty role",
                self.name
            )));
        }
        match &self.value {
            Value::Scalar(scalar) if scalar.is_negative() => {
                return Err(ResourceError::Invalid(format!(
                    "resource {} has a negative scalar value",
                    self.name
                )));
            }
            Value::Ranges(ranges) => {
                if ranges.intervals().iter().any(|(begin, end)| begin > end) {
                    return Err(ResourceError::Invalid(format!(
                        "resource {} has a malformed range",
                        self.name
                    )));
                }
            }
            _ => {}
        }
        if let Some(persistence) = &self.persistence {
            if persistence.id.is_empty() || persistence.container_path.is_empty() {
                return Err(ResourceError::Invalid(format!(
                    "persistent volume on {} needs both an id and a container path",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.role == DEFAULT_ROLE {
            write!(f, "{}:{}", self.name, self.value)
        } else {
            write!(f, "{}({}):{}", self.name, self.role, self.value)
        }
    }
}

/// A normalized bag of resources.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resources(Vec<Resource>);

// Bags are equal as multisets; entry order is incidental.
impl PartialEq for Resources {
    fn eq(&self, other: &Resources) -> bool {
        self.contains(other) && other.contains(self)
    }
}

impl Eq for Resources {}

impl Resources {
    pub fn new() -> Self {
        Resources(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.0.iter()
    }

    /// Merge a resource into the bag, preserving normalization.
    pub fn add(&mut self, resource: Resource) {
        if resource.is_empty() {
            return;
        }
        match self.0.iter_mut().find(|r| r.matches(&resource)) {
            Some(existing) => existing.value.merge(&resource.value),
            None => self.0.push(resource),
        }
    }

    /// Whether the bag wholly contains another bag.
    pub fn contains(&self, other: &Resources) -> bool {
        other.0.iter().all(|needed| {
            self.0
                .iter()
                .find(|r| r.matches(needed))
                .map(|r| r.value.contains(&needed.value))
                .unwrap_or(false)
        })
    }

    /// Subtract another bag. Fails when `other` is not contained, in
    /// which case `self` is left untouched.
    pub fn subtract(&self, other: &Resources) -> Result<Resources> {
        if !self.contains(other) {
            return Err(ResourceError::NotContained {
                minuend: self.to_string(),
                subtrahend: other.to_string(),
            });
        }
        let mut result = self.clone();
        for needed in &other.0 {
            if let Some(existing) = result.0.iter_mut().find(|r| r.matches(needed)) {
                existing.value.remove(&needed.value);
            }
        }
        result.0.retain(|r| !r.is_empty());
        Ok(result)
    }

    /// Subtract whatever part of `other` is present; never fails. Used
    /// where the subtrahend may overlap only partially, e.g. applying
    /// decline filters to an offerable pool.
    pub fn saturating_subtract(&self, other: &Resources) -> Resources {
        let mut result = self.clone();
        for needed in &other.0 {
            if let Some(existing) = result.0.iter_mut().find(|r| r.matches(needed)) {
                existing.value.remove_clamped(&needed.value);
            }
        }
        result.0.retain(|r| !r.is_empty());
        result
    }

    /// Keep the resources satisfying a predicate.
    pub fn filter(&self, predicate: impl Fn(&Resource) -> bool) -> Resources {
        Resources(self.0.iter().filter(|r| predicate(r)).cloned().collect())
    }

    /// Resources assigned to a given role.
    pub fn by_role(&self, role: &str) -> Resources {
        self.filter(|r| r.role == role)
    }

    /// Unreserved resources only.
    pub fn unreserved(&self) -> Resources {
        self.filter(Resource::is_unreserved)
    }

    /// Reserved resources (any role other than "*" or carrying a principal).
    pub fn reserved(&self) -> Resources {
        self.filter(|r| !r.is_unreserved())
    }

    /// Persistent volumes only.
    pub fn persistent_volumes(&self) -> Resources {
        self.filter(Resource::is_persistent)
    }

    /// Strip reservation and persistence and rebind every resource to
    /// `role` (the default role when `None`). Flattening maps reserved
    /// resources back onto their unreserved equivalents.
    pub fn flatten(&self, role: Option<&str>) -> Resources {
        let role = role.unwrap_or(DEFAULT_ROLE);
        let mut result = Resources::new();
        for resource in &self.0 {
            let mut flattened = resource.clone();
            flattened.role = role.to_string();
            flattened.reservation = None;
            flattened.persistence = None;
            Resources::add(&mut result, flattened);
        }
        result
    }

    /// Total scalar quantity of a named resource across all roles.
    pub fn scalar_quantity(&self, name: &str) -> Scalar {
        self.0
            .iter()
            .filter(|r| r.name == name)
            .fold(Scalar::ZERO, |total, r| match &r.value {
                Value::Scalar(scalar) => total + *scalar,
                _ => total,
            })
    }

    /// Names of scalar resources present in the bag.
    pub fn scalar_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .0
            .iter()
            .filter(|r| r.value.kind() == ValueKind::Scalar)
            .map(|r| r.name.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Validate every resource in a slice before admitting it into a bag.
    pub fn validate_all(resources: &[Resource]) -> Result<()> {
        for resource in resources {
            resource.validate()?;
        }
        Ok(())
    }
}

impl From<Vec<Resource>> for Resources {
    fn from(resources: Vec<Resource>) -> Self {
        let mut bag = Resources::new();
        for resource in resources {
            Resources::add(&mut bag, resource);
        }
        bag
    }
}

impl FromIterator<Resource> for Resources {
    fn from_iter<I: IntoIterator<Item = Resource>>(iter: I) -> Self {
        let mut bag = Resources::new();
        for resource in iter {
            Resources::add(&mut bag, resource);
        }
        bag
    }
}

impl Add for Resources {
    type Output = Resources;

    fn add(mut self, other: Resources) -> Resources {
        self += other;
        self
    }
}

impl AddAssign for Resources {
    fn add_assign(&mut self, other: Resources) {
        for resource in other.0 {
            self.add(resource);
        }
    }
}

impl AddAssign<&Resources> for Resources {
    fn add_assign(&mut self, other: &Resources) {
        for resource in &other.0 {
            self.add(resource.clone());
        }
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "{{}}");
        }
        for (i, resource) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ";")?;
            }
            write!(f, "{}", resource)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn cpus(units: i64) -> Resource {
        Resource::scalar("cpus", Scalar::from_units(units))
    }

    fn mem(units: i64) -> Resource {
        Resource::scalar("mem", Scalar::from_units(units))
    }

    #[test]
    fn test_add_normalizes() {
        let mut bag = Resources::new();
        Resources::add(&mut bag, cpus(1));
        Resources::add(&mut bag, cpus(2));
        Resources::add(&mut bag, mem(512));

        assert_eq!(bag.scalar_quantity("cpus"), Scalar::from_units(3));
        assert_eq!(bag.iter().count(), 2);
    }

    #[test]
    fn test_subtract_partial() {
        let bag: Resources = vec![cpus(2), mem(1024)].into();
        let taken: Resources = vec![cpus(1), mem(512)].into();

        let rest = bag.subtract(&taken).unwrap();
        assert_eq!(rest.scalar_quantity("cpus"), Scalar::from_units(1));
        assert_eq!(rest.scalar_quantity("mem"), Scalar::from_units(512));

        // Subtracting more than is present fails and leaves the bag intact.
        let too_much: Resources = vec![cpus(5)].into();
        assert!(bag.subtract(&too_much).is_err());
        assert_eq!(bag.scalar_quantity("cpus"), Scalar::from_units(2));
    }

    #[test]
    fn test_subtract_removes_empty_entries() {
        let bag: Resources = vec![cpus(2)].into();
        let rest = bag.subtract(&vec![cpus(2)].into()).unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn test_saturating_subtract() {
        let bag: Resources = vec![cpus(1), mem(512)].into();
        let filter: Resources = vec![cpus(4)].into();

        let rest = bag.saturating_subtract(&filter);
        assert_eq!(rest.scalar_quantity("cpus"), Scalar::ZERO);
        assert_eq!(rest.scalar_quantity("mem"), Scalar::from_units(512));
    }

    #[test]
    fn test_roles_do_not_mix() {
        let mut bag = Resources::new();
        Resources::add(&mut bag, cpus(1));
        Resources::add(&mut bag, cpus(1).with_role("analytics"));

        assert_eq!(bag.iter().count(), 2);
        assert_eq!(bag.by_role("analytics").scalar_quantity("cpus"), Scalar::from_units(1));
        assert_eq!(bag.unreserved().scalar_quantity("cpus"), Scalar::from_units(1));

        // A reserved bag does not contain an unreserved request.
        let unreserved_request: Resources = vec![cpus(2)].into();
        assert!(!bag.contains(&unreserved_request));
    }

    #[test]
    fn test_flatten() {
        let bag: Resources = vec![
            cpus(1).with_role("analytics").with_reservation("ops"),
            cpus(1),
        ]
        .into();
        let flat = bag.flatten(None);
        assert_eq!(flat.iter().count(), 1);
        assert_eq!(flat.scalar_quantity("cpus"), Scalar::from_units(2));
    }

    #[test]
    fn test_ranges_in_bag() {
        let bag: Resources = vec![Resource::ranges("ports", vec![(31000, 32000)])].into();
        let slice: Resources = vec![Resource::ranges("ports", vec![(31000, 31001)])].into();

        assert!(bag.contains(&slice));
        let rest = bag.subtract(&slice).unwrap();
        assert!(!rest.contains(&slice));
        assert!(rest.contains(&vec![Resource::ranges("ports", vec![(31002, 32000)])].into()));
    }

    #[test]
    fn test_persistent_volume_identity() {
        let volume = Resource::scalar("disk", Scalar::from_units(64))
            .with_role("analytics")
            .with_persistence("vol-1", "/data");
        let plain = Resource::scalar("disk", Scalar::from_units(64)).with_role("analytics");

        // The volume and the plain disk are distinct algebra tuples.
        let bag: Resources = vec![volume.clone(), plain].into();
        assert_eq!(bag.iter().count(), 2);
        assert_eq!(bag.persistent_volumes().iter().count(), 1);
    }

    #[test]
    fn test_validate() {
        assert!(cpus(1).validate().is_ok());
        assert!(Resource::scalar("cpus", Scalar::from_millis(-1)).validate().is_err());

        let bad_volume = Resource::scalar("disk", Scalar::from_units(1)).with_persistence("", "/d");
        assert!(bad_volume.validate().is_err());
    }

    #[test]
    fn test_display_round_trip() {
        let bag: Resources = vec![
            cpus(2),
            mem(1024),
            Resource::ranges("ports", vec![(31000, 32000)]),
        ]
        .into();
        let text = bag.to_string();
        let parsed = Resources::from_str(&text).unwrap();
        assert_eq!(parsed, bag);
    }
}
