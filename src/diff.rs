use serde_json::Value;

use crate::types::*;

/// Collect `(path, old, new)` for every leaf that differs between two JSON
/// documents. Array elements are addressed by index.
pub(crate) fn diff_json(
    previous: &Value,
    current: &Value,
    path_prefix: &str,
    changes: &mut Vec<(String, Value, Value)>,
) {
    let join = |key: &str| {
        if path_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{path_prefix}.{key}")
        }
    };

    match (previous, current) {
        (Value::Object(prev_map), Value::Object(curr_map)) => {
            for (key, curr_val) in curr_map {
                let path = join(key);
                match prev_map.get(key) {
                    Some(prev_val) => diff_json(prev_val, curr_val, &path, changes),
                    None => {
                        if curr_val.is_object() {
                            diff_json(&Value::Object(serde_json::Map::new()), curr_val, &path, changes);
                        } else {
                            changes.push((path, Value::Null, curr_val.clone()));
                        }
                    }
                }
            }
        }
        (Value::Array(prev_arr), Value::Array(curr_arr)) if prev_arr.len() == curr_arr.len() => {
            for (i, (prev_val, curr_val)) in prev_arr.iter().zip(curr_arr).enumerate() {
                diff_json(prev_val, curr_val, &join(&i.to_string()), changes);
            }
        }
        (prev, curr) if prev != curr => {
            changes.push((path_prefix.to_string(), prev.clone(), curr.clone()));
        }
        _ => {}
    }
}

/// Typed events for the fields that differ between two statuses of one
/// device. A first sighting yields `DeviceAdded` only.
pub(crate) fn status_events(
    identity: DeviceIdentity,
    previous: Option<&DeviceStatus>,
    current: &DeviceStatus,
) -> Vec<Event> {
    let Some(prev) = previous else {
        return vec![Event::DeviceAdded { identity }];
    };

    let (old, new) = (&prev.report, &current.report);
    let mut events = Vec::new();

    if old.power != new.power {
        events.push(Event::PowerChanged {
            identity,
            on: new.power,
        });
    }
    if old.mode != new.mode {
        events.push(Event::ModeChanged {
            identity,
            mode: new.mode,
        });
    }
    if old.fan != new.fan {
        events.push(Event::FanChanged {
            identity,
            fan: new.fan,
        });
    }
    if old.target_temperature != new.target_temperature {
        events.push(Event::TargetTemperatureChanged {
            identity,
            temperature: new.target_temperature,
        });
    }
    if old.current_temperature != new.current_temperature {
        events.push(Event::CurrentTemperatureChanged {
            identity,
            temperature: new.current_temperature,
        });
    }
    if old.alarm_code != new.alarm_code {
        events.push(Event::AlarmChanged {
            identity,
            code: new.alarm_code,
        });
    }
    if let Some(index) = current.control_index
        && prev.control_index != Some(index)
    {
        events.push(Event::ControlIndexAssigned { identity, index });
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn status(report: StatusReport, control_index: Option<u32>) -> DeviceStatus {
        DeviceStatus {
            report,
            control_index,
            last_source: Source::Http,
            last_updated: Utc::now(),
            version: 1,
        }
    }

    #[test]
    fn diff_detects_leaf_changes() {
        let prev = json!({"model": "A", "nested": {"x": 1, "y": 2}});
        let curr = json!({"model": "A", "nested": {"x": 1, "y": 3}, "sw": "1.0"});
        let mut changes = Vec::new();
        diff_json(&prev, &curr, "", &mut changes);

        assert_eq!(changes.len(), 2);
        assert!(changes.iter().any(|(p, old, new)| p == "nested.y" && *old == json!(2) && *new == json!(3)));
        assert!(changes.iter().any(|(p, old, _)| p == "sw" && old.is_null()));
    }

    #[test]
    fn diff_walks_unit_arrays() {
        let prev = json!({"unit": [{"tempIn": 25}, {"tempIn": 22}]});
        let curr = json!({"unit": [{"tempIn": 25}, {"tempIn": 23}]});
        let mut changes = Vec::new();
        diff_json(&prev, &curr, "", &mut changes);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].0, "unit.1.tempIn");
    }

    #[test]
    fn diff_replaces_resized_arrays_whole() {
        let prev = json!({"unit": [1]});
        let curr = json!({"unit": [1, 2]});
        let mut changes = Vec::new();
        diff_json(&prev, &curr, "", &mut changes);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].0, "unit");
    }

    #[test]
    fn first_sighting_is_device_added() {
        let id = DeviceIdentity::new(1, 1, 1);
        let events = status_events(id, None, &status(StatusReport::default(), None));
        assert_eq!(events, vec![Event::DeviceAdded { identity: id }]);
    }

    #[test]
    fn field_changes_emit_typed_events() {
        let id = DeviceIdentity::new(1, 2, 5);
        let before = status(StatusReport::default(), None);
        let after = status(
            StatusReport {
                power: true,
                mode: HvacMode::Heat,
                target_temperature: Some(21),
                ..StatusReport::default()
            },
            Some(7),
        );

        let events = status_events(id, Some(&before), &after);
        assert_eq!(
            events,
            vec![
                Event::PowerChanged { identity: id, on: true },
                Event::ModeChanged { identity: id, mode: HvacMode::Heat },
                Event::TargetTemperatureChanged { identity: id, temperature: Some(21) },
                Event::ControlIndexAssigned { identity: id, index: 7 },
            ]
        );
    }

    #[test]
    fn unchanged_status_emits_nothing() {
        let id = DeviceIdentity::new(1, 2, 5);
        let s = status(StatusReport::default(), Some(3));
        assert!(status_events(id, Some(&s), &s).is_empty());
    }
}
