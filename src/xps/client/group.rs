use super::XpsClient;
use crate::error::FlyError;
use crate::types::XpsValue;
use crate::xps::protocol::GroupState;

impl XpsClient {
    /// List every object defined on the controller.
    ///
    /// Groups appear as bare names (`scan`), positioners as
    /// `group.positioner` (`scan.X`).
    pub fn objects_list_get(&mut self) -> Result<Vec<String>, FlyError> {
        let result = self.quick_send("ObjectsListGet", vec![], vec!["char *"])?;
        let raw = result
            .first()
            .ok_or_else(|| FlyError::Protocol("No object list returned".to_string()))?
            .as_str()?;

        // The list is terminated by an empty entry; anything after it is
        // not a motion object.
        let head = raw.split(";;").next().unwrap_or_default();
        Ok(head
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub fn group_status_get(&mut self, group: &str) -> Result<GroupState, FlyError> {
        let result = self.quick_send("GroupStatusGet", vec![group.into()], vec!["int *"])?;
        match result.first() {
            Some(value) => Ok(GroupState::from(value.as_i32()?)),
            None => Err(FlyError::Protocol("No group status returned".to_string())),
        }
    }

    /// Per-positioner motion flags for a group of `size` positioners.
    pub fn group_motion_status_get(
        &mut self,
        group: &str,
        size: usize,
    ) -> Result<Vec<bool>, FlyError> {
        let result = self.quick_send(
            "GroupMotionStatusGet",
            vec![group.into()],
            vec!["int *"; size],
        )?;
        result
            .iter()
            .map(|v| v.as_i32().map(|flag| flag != 0))
            .collect()
    }

    pub fn group_position_current_get(
        &mut self,
        group: &str,
        size: usize,
    ) -> Result<Vec<f64>, FlyError> {
        let result = self.quick_send(
            "GroupPositionCurrentGet",
            vec![group.into()],
            vec!["double *"; size],
        )?;
        result.iter().map(XpsValue::as_f64).collect()
    }

    /// Absolute move of a group or a single positioner (`group.positioner`).
    pub fn group_move_absolute(&mut self, name: &str, targets: &[f64]) -> Result<(), FlyError> {
        let mut args: Vec<XpsValue> = vec![name.into()];
        args.extend(targets.iter().map(|&t| XpsValue::Double(t)));
        self.quick_send("GroupMoveAbsolute", args, vec![])?;
        Ok(())
    }

    pub fn group_move_abort(&mut self, name: &str) -> Result<(), FlyError> {
        self.quick_send("GroupMoveAbort", vec![name.into()], vec![])?;
        Ok(())
    }

    pub fn group_initialize(&mut self, group: &str) -> Result<(), FlyError> {
        self.quick_send("GroupInitialize", vec![group.into()], vec![])?;
        Ok(())
    }

    pub fn group_home_search(&mut self, group: &str) -> Result<(), FlyError> {
        self.quick_send("GroupHomeSearch", vec![group.into()], vec![])?;
        Ok(())
    }

    pub fn group_motion_enable(&mut self, group: &str) -> Result<(), FlyError> {
        self.quick_send("GroupMotionEnable", vec![group.into()], vec![])?;
        Ok(())
    }
}
