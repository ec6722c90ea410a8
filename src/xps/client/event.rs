use super::XpsClient;
use crate::error::FlyError;
use crate::types::XpsValue;

/// Each extended event trigger/action takes four parameters; the flyer
/// never needs anything but zeros.
const ZERO_PARAMS: [&str; 4] = ["0", "0", "0", "0"];

fn with_zero_params(names: &[&str]) -> Vec<XpsValue> {
    names
        .iter()
        .flat_map(|name| std::iter::once(*name).chain(ZERO_PARAMS))
        .map(XpsValue::from)
        .collect()
}

impl XpsClient {
    pub fn event_extended_configuration_trigger_set(
        &mut self,
        events: &[&str],
    ) -> Result<(), FlyError> {
        self.quick_send(
            "EventExtendedConfigurationTriggerSet",
            with_zero_params(events),
            vec![],
        )?;
        Ok(())
    }

    pub fn event_extended_configuration_action_set(
        &mut self,
        actions: &[&str],
    ) -> Result<(), FlyError> {
        self.quick_send(
            "EventExtendedConfigurationActionSet",
            with_zero_params(actions),
            vec![],
        )?;
        Ok(())
    }

    /// Register the configured trigger/action pair and return its id.
    pub fn event_extended_start(&mut self) -> Result<i32, FlyError> {
        let result = self.quick_send("EventExtendedStart", vec![], vec!["int *"])?;
        match result.first() {
            Some(value) => value.as_i32(),
            None => Err(FlyError::Protocol("No event id returned".to_string())),
        }
    }

    pub fn event_extended_all_get(&mut self) -> Result<Vec<i32>, FlyError> {
        let result = self.quick_send("EventExtendedAllGet", vec![], vec!["char *"])?;
        let raw = match result.first() {
            Some(value) => value.as_str()?,
            None => return Ok(Vec::new()),
        };

        raw.split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse()
                    .map_err(|_| FlyError::Protocol(format!("Invalid event id {s:?}")))
            })
            .collect()
    }

    pub fn event_extended_remove(&mut self, id: i32) -> Result<(), FlyError> {
        self.quick_send("EventExtendedRemove", vec![id.into()], vec![])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_name_gets_four_zero_params() {
        let args = with_zero_params(&["Always", "scan.PVT.TrajectoryPulse"]);
        let rendered: Vec<String> = args.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            ["Always", "0", "0", "0", "0", "scan.PVT.TrajectoryPulse", "0", "0", "0", "0"]
        );
    }
}
