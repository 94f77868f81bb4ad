use serde_json::Value;

use crate::types::*;
use crate::{Error, Result};

pub const API_PATH: &str = "/cgi-bin/api.html";

/// HTTP `grp` is zero-based; the broadcast frame's group byte is one-based.
const HTTP_GROUP_OFFSET: u8 = 1;

pub fn device_info_query() -> String {
    format!("{API_PATH}?f=1")
}

pub fn brand_query() -> String {
    format!("{API_PATH}?f=24")
}

pub fn ac_list_query(page: u32) -> String {
    format!("{API_PATH}?f=17&p={page}")
}

/// Partial control update. Absent fields are left unchanged by the gateway.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlCommand {
    pub power: Option<bool>,
    pub mode: Option<HvacMode>,
    pub target_temperature: Option<u8>,
    pub fan: Option<FanSpeed>,
}

impl ControlCommand {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn power(mut self, on: bool) -> Self {
        self.power = Some(on);
        self
    }

    pub fn mode(mut self, mode: HvacMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn target_temperature(mut self, celsius: u8) -> Self {
        self.target_temperature = Some(celsius);
        self
    }

    pub fn fan(mut self, fan: FanSpeed) -> Self {
        self.fan = Some(fan);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.power.is_none()
            && self.mode.is_none()
            && self.target_temperature.is_none()
            && self.fan.is_none()
    }
}

pub fn build_control_query(control_index: u32, cmd: &ControlCommand) -> Result<String> {
    if cmd.is_empty() {
        return Err(Error::InvalidArgument("control command has no fields".into()));
    }

    let mut query = format!("{API_PATH}?f=18&idx={control_index}");

    if let Some(on) = cmd.power {
        query.push_str(&format!("&on={}", on as u8));
    }
    if let Some(mode) = cmd.mode {
        if !mode.is_recognized() {
            return Err(Error::InvalidArgument(format!("unsupported mode code {}", mode.code())));
        }
        query.push_str(&format!("&mode={}", mode.code()));
    }
    if let Some(temp) = cmd.target_temperature {
        if checked_temperature(temp).is_none() {
            return Err(Error::InvalidArgument(format!(
                "target temperature {temp} outside {MIN_TEMPERATURE}..={MAX_TEMPERATURE}"
            )));
        }
        query.push_str(&format!("&tempSet={temp}"));
    }
    if let Some(fan) = cmd.fan {
        if !fan.is_recognized() {
            return Err(Error::InvalidArgument(format!("unsupported fan code {}", fan.code())));
        }
        query.push_str(&format!("&fan={}", fan.code()));
    }

    Ok(query)
}

/// Fails with `Error::Gateway` when the response carries a non-zero `err`.
pub fn check_err(body: &Value) -> Result<()> {
    match body.get("err").and_then(lenient_i64) {
        Some(0) | None => Ok(()),
        Some(code) => Err(Error::Gateway(code)),
    }
}

/// The gateway sends numbers either as JSON numbers or as numeric strings.
fn lenient_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn field_u64(obj: &Value, key: &str) -> Option<u64> {
    obj.get(key).and_then(lenient_i64).and_then(|v| u64::try_from(v).ok())
}

fn field_u8(obj: &Value, key: &str) -> Option<u8> {
    field_u64(obj, key).and_then(|v| u8::try_from(v).ok())
}

fn field_u16(obj: &Value, key: &str) -> Option<u16> {
    field_u64(obj, key).and_then(|v| u16::try_from(v).ok())
}

fn field_string(obj: &Value, key: &str) -> String {
    match obj.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

pub fn parse_device_info(body: &Value) -> Result<(String, String, String)> {
    check_err(body)?;
    if body.get("model").is_none() {
        return Err(Error::Protocol("device info without model".into()));
    }
    Ok((
        field_string(body, "model"),
        field_string(body, "sw"),
        field_string(body, "id"),
    ))
}

pub fn parse_brand_info(body: &Value) -> Result<BrandInfo> {
    check_err(body)?;
    let brand = field_u16(body, "brand")
        .ok_or_else(|| Error::Protocol("brand info without brand".into()))?;
    Ok(BrandInfo {
        brand,
        protocol: field_u16(body, "proto").unwrap_or(0),
        max_devices: field_u16(body, "maxnum").unwrap_or(0),
    })
}

/// Parse one AC-list page. A missing `unit` array is an empty page.
pub fn parse_units(body: &Value) -> Result<Vec<UnitSnapshot>> {
    check_err(body)?;
    let units = match body.get("unit") {
        Some(Value::Array(units)) => units,
        Some(other) => return Err(Error::Protocol(format!("unexpected unit field: {other}"))),
        None => return Ok(Vec::new()),
    };
    units.iter().map(parse_unit).collect()
}

fn parse_unit(unit: &Value) -> Result<UnitSnapshot> {
    let missing = |key: &str| Error::Protocol(format!("unit without {key}: {unit}"));

    let grp = field_u8(unit, "grp").unwrap_or(0);
    let outdoor = field_u8(unit, "oa").ok_or_else(|| missing("oa"))?;
    let indoor = field_u8(unit, "ia").ok_or_else(|| missing("ia"))?;
    let control_index = field_u64(unit, "idx")
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| missing("idx"))?;

    Ok(UnitSnapshot {
        identity: DeviceIdentity::new(grp.saturating_add(HTTP_GROUP_OFFSET), outdoor, indoor),
        control_index,
        report: StatusReport {
            power: field_u8(unit, "on").unwrap_or(0) != 0,
            mode: HvacMode::from_code(field_u8(unit, "mode").unwrap_or(0)),
            fan: FanSpeed::from_code(field_u8(unit, "fan").unwrap_or(0)),
            target_temperature: field_u8(unit, "tempSet").and_then(checked_temperature),
            current_temperature: field_u8(unit, "tempIn").and_then(checked_temperature),
            alarm_code: field_u8(unit, "alarm").unwrap_or(0),
        },
    })
}

const BRANDS: &[(u16, &str)] = &[
    (1, "Hitachi"),
    (2, "Daikin"),
    (3, "Toshiba"),
    (4, "Mitsubishi Heavy Industries"),
    (5, "Mitsubishi Electric"),
    (6, "Gree"),
    (7, "Hisense"),
    (8, "Midea"),
    (9, "Haier"),
    (10, "LG"),
    (13, "Samsung"),
    (14, "AUX"),
    (15, "Panasonic"),
    (16, "York"),
    (19, "Gree 4th Gen"),
    (21, "McQuay"),
    (24, "TCL"),
    (25, "Chigo"),
    (26, "TICA"),
    (35, "CH-York"),
    (36, "CoolWind"),
    (37, "York Qingdao"),
    (38, "Fujitsu"),
    (39, "Samsung (NotNASA_BMS)"),
    (40, "Samsung (NASA_BMS)"),
    (42, "Fudiwosi"),
    (43, "B23"),
    (44, "EK"),
    (45, "Hitachi Q3 Converter"),
    (46, "YCJ"),
    (47, "Depulaite"),
    (48, "Hailin A8033 Thermostat"),
    (49, "Midea CoolWind (Special Protocol)"),
    (50, "Hitachi Mini"),
    (56, "HL8023MD Thermostat"),
    (58, "Bole"),
    (59, "Tianlang (Five Constant System)"),
    (101, "CH-Emerson"),
    (102, "CH-McQuay"),
    (103, "Trane"),
    (104, "CH-Carrier"),
    (105, "CH-York (A1B1)"),
    (126, "Toshiba (Central Control Address)"),
    (128, "GREE_M"),
    (129, "McQuay_M"),
    (131, "Midea Modular"),
    (132, "DUNAN_M"),
    (134, "TICA Modular"),
    (135, "Guoxiang_M"),
    (253, "Mitsubishi Heavy Industries (KX4)"),
    (381, "Fujitsu Protocol Converter"),
];

const SIMULATOR_BRAND: u16 = 255;

pub fn brand_name(brand: u16, protocol: u16) -> String {
    if brand == SIMULATOR_BRAND {
        return format!("Simulator {protocol} units");
    }
    BRANDS
        .iter()
        .find(|(id, _)| *id == brand)
        .map(|(_, name)| name.to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn control_query_only_includes_present_fields() {
        let cmd = ControlCommand::new().target_temperature(22);
        assert_eq!(
            build_control_query(7, &cmd).unwrap(),
            "/cgi-bin/api.html?f=18&idx=7&tempSet=22"
        );

        let cmd = ControlCommand::new()
            .power(true)
            .mode(HvacMode::Heat)
            .target_temperature(16)
            .fan(FanSpeed::Low);
        assert_eq!(
            build_control_query(3, &cmd).unwrap(),
            "/cgi-bin/api.html?f=18&idx=3&on=1&mode=8&tempSet=16&fan=4"
        );
    }

    #[test]
    fn control_query_distinguishes_zero_from_absent() {
        let cmd = ControlCommand::new().mode(HvacMode::Off).fan(FanSpeed::Auto);
        assert_eq!(
            build_control_query(0, &cmd).unwrap(),
            "/cgi-bin/api.html?f=18&idx=0&mode=0&fan=0"
        );
    }

    #[test]
    fn control_query_rejects_out_of_range_temperature() {
        for temp in [0, 15, 31, 255] {
            let err = build_control_query(1, &ControlCommand::new().target_temperature(temp))
                .unwrap_err();
            assert!(matches!(err, Error::InvalidArgument(_)), "{temp}: {err:?}");
        }
        assert!(build_control_query(1, &ControlCommand::new().target_temperature(30)).is_ok());
    }

    #[test]
    fn control_query_rejects_empty_and_unrecognized() {
        assert!(matches!(
            build_control_query(1, &ControlCommand::new()),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            build_control_query(1, &ControlCommand::new().mode(HvacMode::Unrecognized(3))),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn check_err_codes() {
        assert!(check_err(&json!({"err": 0})).is_ok());
        assert!(check_err(&json!({"model": "x"})).is_ok());
        assert!(matches!(check_err(&json!({"err": 2})), Err(Error::Gateway(2))));
        assert!(matches!(check_err(&json!({"err": "5"})), Err(Error::Gateway(5))));
    }

    #[test]
    fn parse_units_page() {
        let body = json!({
            "err": 0,
            "unit": [
                {"grp": 0, "oa": 2, "ia": 5, "idx": 7, "on": 1, "mode": 1,
                 "tempSet": 24, "fan": 2, "tempIn": "26", "alarm": 0},
                {"grp": "0", "oa": 2, "ia": 6, "idx": "8", "on": 0, "mode": 8,
                 "tempSet": 35, "fan": 9, "tempIn": 12, "alarm": 3}
            ]
        });
        let units = parse_units(&body).unwrap();
        assert_eq!(units.len(), 2);

        assert_eq!(units[0].identity, DeviceIdentity::new(1, 2, 5));
        assert_eq!(units[0].control_index, 7);
        assert!(units[0].report.power);
        assert_eq!(units[0].report.mode, HvacMode::Cool);
        assert_eq!(units[0].report.fan, FanSpeed::Medium);
        assert_eq!(units[0].report.current_temperature, Some(26));

        assert_eq!(units[1].control_index, 8);
        assert_eq!(units[1].report.mode, HvacMode::Heat);
        assert_eq!(units[1].report.fan, FanSpeed::Unrecognized(9));
        assert_eq!(units[1].report.target_temperature, None);
        assert_eq!(units[1].report.current_temperature, None);
        assert_eq!(units[1].report.alarm_code, 3);
    }

    #[test]
    fn parse_units_empty_and_missing() {
        assert!(parse_units(&json!({"err": 0, "unit": []})).unwrap().is_empty());
        assert!(parse_units(&json!({"err": 0})).unwrap().is_empty());
        assert!(parse_units(&json!({"err": 0, "unit": [{"oa": 1}]})).is_err());
    }

    #[test]
    fn parse_info_and_brand() {
        let (model, sw, id) =
            parse_device_info(&json!({"err": 0, "model": "ZH-VRF", "sw": " 1.2.3 ", "id": "A1B2"}))
                .unwrap();
        assert_eq!(model, "ZH-VRF");
        assert_eq!(sw, "1.2.3");
        assert_eq!(id, "A1B2");

        let brand = parse_brand_info(&json!({"err": 0, "brand": 2, "proto": 0, "maxnum": 12})).unwrap();
        assert_eq!(brand.max_devices, 12);
        assert_eq!(brand.name(), "Daikin");
    }

    #[test]
    fn brand_names() {
        assert_eq!(brand_name(5, 0), "Mitsubishi Electric");
        assert_eq!(brand_name(255, 4), "Simulator 4 units");
        assert_eq!(brand_name(999, 0), "Unknown");
    }

    #[test]
    fn endpoint_queries() {
        assert_eq!(device_info_query(), "/cgi-bin/api.html?f=1");
        assert_eq!(brand_query(), "/cgi-bin/api.html?f=24");
        assert_eq!(ac_list_query(3), "/cgi-bin/api.html?f=17&p=3");
    }
}
