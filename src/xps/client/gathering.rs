use super::XpsClient;
use crate::error::FlyError;
use crate::types::XpsValue;

impl XpsClient {
    pub fn gathering_reset(&mut self) -> Result<(), FlyError> {
        self.quick_send("GatheringReset", vec![], vec![])?;
        Ok(())
    }

    /// Select the data types sampled on each gathering event,
    /// e.g. `scan.X.CurrentPosition`.
    pub fn gathering_configuration_set(&mut self, types: &[String]) -> Result<(), FlyError> {
        let args = types.iter().map(|t| XpsValue::from(t.as_str())).collect();
        self.quick_send("GatheringConfigurationSet", args, vec![])?;
        Ok(())
    }

    /// Number of samples gathered so far and the buffer capacity.
    pub fn gathering_current_number_get(&mut self) -> Result<(usize, usize), FlyError> {
        let result = self.quick_send(
            "GatheringCurrentNumberGet",
            vec![],
            vec!["int *", "int *"],
        )?;

        if result.len() >= 2 {
            let current = result[0].as_i32()?.max(0) as usize;
            let maximum = result[1].as_i32()?.max(0) as usize;
            Ok((current, maximum))
        } else {
            Err(FlyError::Protocol(
                "Invalid gathering count response".to_string(),
            ))
        }
    }

    /// Fetch `count` gathered lines starting at `start`, first column only.
    pub fn gathering_data_multiple_lines_get(
        &mut self,
        start: usize,
        count: usize,
    ) -> Result<Vec<f64>, FlyError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let result = self.quick_send(
            "GatheringDataMultipleLinesGet",
            vec![start.into(), count.into()],
            vec!["char *"],
        )?;
        let raw = result
            .first()
            .ok_or_else(|| FlyError::Protocol("No gathering data returned".to_string()))?
            .as_str()?;

        raw.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                let first = line.split(';').next().unwrap_or(line);
                first.trim().parse::<f64>().map_err(|_| {
                    FlyError::Protocol(format!("Invalid gathering sample {line:?}"))
                })
            })
            .collect()
    }

    pub fn gathering_stop_and_save(&mut self) -> Result<(), FlyError> {
        self.quick_send("GatheringStopAndSave", vec![], vec![])?;
        Ok(())
    }
}
