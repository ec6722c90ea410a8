use crate::error::FlyError;
use crate::link::ControllerLink;
use crate::types::Direction;
use crate::xps::protocol::GroupState;
use log::{info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

/// A controller group and its positioners, in controller order.
#[derive(Debug, Clone, Serialize)]
pub struct AxisGroup {
    pub name: String,
    /// Full positioner names (`group.positioner`)
    pub members: Vec<String>,
    pub state: GroupState,
}

impl AxisGroup {
    /// Only groups reporting a ready state at discovery can be bound.
    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    pub fn index_of(&self, positioner: &str) -> Option<usize> {
        self.members.iter().position(|m| m == positioner)
    }
}

/// A logical axis name mapped onto one positioner of a group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AxisBinding {
    pub logical_name: String,
    /// Full positioner name (`group.positioner`)
    pub positioner: String,
    pub group: String,
    /// Position of the positioner within its group; stable for the
    /// lifetime of the connection.
    pub index: usize,
    /// Number of positioners in the group, needed for group-wide queries.
    pub group_size: usize,
    pub direction: Direction,
    pub unit: String,
    pub settle_time: Duration,
}

/// Controller topology discovered once at startup.
#[derive(Debug, Default)]
pub struct AxisGroupRegistry {
    groups: Vec<AxisGroup>,
    bindings: HashMap<String, AxisBinding>,
}

impl AxisGroupRegistry {
    /// Enumerate controller objects and sort positioners into their groups.
    ///
    /// Groups that are not ready are kept for diagnostics but cannot be
    /// bound; that is not fatal since other groups may still be usable.
    pub fn discover(link: &ControllerLink) -> Result<Self, FlyError> {
        let objects = link.read(|c| c.objects_list_get())?;
        let mut groups: Vec<AxisGroup> = Vec::new();

        for object in objects {
            let prefix = object.split_once('.').map(|(g, _)| g.to_string());
            match prefix {
                None => {
                    let state = match link.read(|c| c.group_status_get(&object)) {
                        Ok(state) => state,
                        Err(FlyError::Device { code, .. }) => {
                            warn!("Group {object} status query failed with {code}");
                            GroupState::Other(code.code())
                        }
                        Err(e) => return Err(e),
                    };
                    if state.is_ready() {
                        info!("Group {object} ready ({state})");
                    } else {
                        warn!("Group {object} is not ready for use, status = {state}");
                    }
                    groups.push(AxisGroup {
                        name: object,
                        members: Vec::new(),
                        state,
                    });
                }
                Some(group_name) => {
                    match groups.iter_mut().find(|g| g.name == group_name) {
                        Some(group) => group.members.push(object),
                        None => warn!("Skipping {object}: group {group_name} was not listed"),
                    }
                }
            }
        }

        Ok(Self {
            groups,
            bindings: HashMap::new(),
        })
    }

    /// Build a registry from known groups, bypassing discovery.
    pub fn from_groups(groups: Vec<AxisGroup>) -> Self {
        Self {
            groups,
            bindings: HashMap::new(),
        }
    }

    pub fn groups(&self) -> &[AxisGroup] {
        &self.groups
    }

    /// Groups that passed the readiness check.
    pub fn usable_groups(&self) -> impl Iterator<Item = &AxisGroup> {
        self.groups.iter().filter(|g| g.is_ready())
    }

    pub fn group(&self, name: &str) -> Option<&AxisGroup> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// Bind `axis_name` of `group` under `logical_name`.
    ///
    /// `axis_name` may be given with or without the group prefix.
    pub fn bind(
        &mut self,
        group: &str,
        axis_name: &str,
        logical_name: &str,
        unit: &str,
        direction: Direction,
        settle_time: Duration,
    ) -> Result<AxisBinding, FlyError> {
        let positioner = if axis_name.contains('.') {
            axis_name.to_string()
        } else {
            format!("{group}.{axis_name}")
        };

        let owner = self
            .groups
            .iter()
            .find(|g| g.index_of(&positioner).is_some())
            .ok_or_else(|| FlyError::UnknownAxis(positioner.clone()))?;

        if owner.name != group {
            return Err(FlyError::UnknownAxis(format!(
                "{positioner} belongs to group {}, not {group}",
                owner.name
            )));
        }
        if !owner.is_ready() {
            return Err(FlyError::UnknownGroup(format!(
                "{group} is not ready ({})",
                owner.state
            )));
        }

        let binding = AxisBinding {
            logical_name: logical_name.to_string(),
            index: owner.index_of(&positioner).unwrap_or_default(),
            group_size: owner.members.len(),
            group: owner.name.clone(),
            positioner,
            direction,
            unit: unit.to_string(),
            settle_time,
        };

        self.bindings
            .insert(logical_name.to_string(), binding.clone());
        Ok(binding)
    }

    pub fn binding(&self, logical_name: &str) -> Option<&AxisBinding> {
        self.bindings.get(logical_name)
    }

    /// Number of positioners in `group`, which sizes trajectory rows.
    pub fn group_size(&self, group: &str) -> Result<usize, FlyError> {
        self.group(group)
            .map(|g| g.members.len())
            .ok_or_else(|| FlyError::UnknownGroup(group.to_string()))
    }
}
