//! Control discovery, defaults and validation.
//!
//! Controls are classified once, when a device is opened, into
//! [`ControlKind`] variants. Everything after that (validation, defaults,
//! status) works on the classified form and never re-reads the raw
//! descriptor.
//!
//! Default values are always computed, never taken from the device: many UVC
//! cameras report nonsense defaults (`-8193`, `57343`). The device-reported
//! value is kept alongside as `hardware_default`.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{CameraError, Result};
use crate::traits::{CameraDevice, ControlDescriptor, MenuEntry, RawControlType};

/// Classified control type and its bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlKind {
    /// Integer in `[min, max]`.
    Integer {
        /// Lower bound.
        min: i64,
        /// Upper bound.
        max: i64,
        /// Reported step.
        step: i64,
    },
    /// Off (0) or on (1).
    Boolean,
    /// One of the enumerated options.
    Menu {
        /// Options in device order.
        options: Vec<MenuEntry>,
    },
}

impl ControlKind {
    /// Inclusive value bounds.
    pub fn bounds(&self) -> (i64, i64) {
        match self {
            Self::Integer { min, max, .. } => (*min, *max),
            Self::Boolean => (0, 1),
            Self::Menu { options } => {
                let min = options.iter().map(|entry| entry.value).min().unwrap_or(0);
                let max = options.iter().map(|entry| entry.value).max().unwrap_or(0);
                (min, max)
            }
        }
    }

    /// Whether `value` is acceptable for this kind.
    pub fn accepts(&self, value: i64) -> bool {
        match self {
            Self::Integer { min, max, .. } => (*min..=*max).contains(&value),
            Self::Boolean => value == 0 || value == 1,
            Self::Menu { options } => options.iter().any(|entry| entry.value == value),
        }
    }
}

/// A discovered control.
#[derive(Debug, Clone, Serialize)]
pub struct Control {
    /// Device control id.
    pub id: u32,
    /// Unique name.
    pub name: String,
    /// Classified kind and bounds.
    #[serde(flatten)]
    pub kind: ControlKind,
    /// Computed default.
    pub default: i64,
    /// Default the device reported, if any.
    pub hardware_default: Option<i64>,
    /// Last known value.
    pub current: i64,
}

impl Control {
    /// Classify a device descriptor.
    ///
    /// Unknown types, inverted bounds and empty menus are rejected with
    /// [`CameraError::UnsupportedProperty`].
    pub fn from_descriptor(desc: &ControlDescriptor) -> Result<Self> {
        let unsupported = |why: &str| CameraError::UnsupportedProperty(format!("{}: {why}", desc.name));

        let kind = match &desc.kind {
            RawControlType::Integer => {
                if desc.minimum > desc.maximum {
                    return Err(unsupported(&format!(
                        "inverted bounds [{}, {}]",
                        desc.minimum, desc.maximum
                    )));
                }
                ControlKind::Integer {
                    min: desc.minimum,
                    max: desc.maximum,
                    step: desc.step.max(1),
                }
            }
            RawControlType::Boolean => ControlKind::Boolean,
            RawControlType::Menu => {
                if desc.menu.is_empty() {
                    return Err(unsupported("menu without options"));
                }
                ControlKind::Menu {
                    options: desc.menu.clone(),
                }
            }
            RawControlType::Other(typ) => return Err(unsupported(&format!("type {typ}"))),
        };

        let default = compute_default(&desc.name, &kind);
        Ok(Self {
            id: desc.id,
            name: desc.name.clone(),
            kind,
            default,
            hardware_default: desc.default,
            current: desc.current,
        })
    }

    /// Check `value` against this control's bounds.
    pub fn validate(&self, value: i64) -> Result<()> {
        if self.kind.accepts(value) {
            return Ok(());
        }
        let (min, max) = self.kind.bounds();
        Err(CameraError::OutOfRange {
            name: self.name.clone(),
            value,
            min,
            max,
        })
    }

    /// Whether this control selects the auto-exposure mode.
    pub fn is_auto_exposure(&self) -> bool {
        matches!(self.kind, ControlKind::Menu { .. }) && is_auto_exposure_name(&self.name)
    }
}

/// Compute the default value for a classified control.
///
/// - integer: midpoint of the bounds, rounded toward `min`
/// - boolean: off
/// - menu: first option; auto-exposure menus prefer an automatic option
pub fn compute_default(name: &str, kind: &ControlKind) -> i64 {
    match kind {
        ControlKind::Integer { min, max, .. } => midpoint(*min, *max),
        ControlKind::Boolean => 0,
        ControlKind::Menu { options } => {
            let auto = is_auto_exposure_name(name)
                .then(|| options.iter().find(|entry| is_auto_option(&entry.label)))
                .flatten();
            auto.or_else(|| options.first())
                .map_or(0, |entry| entry.value)
        }
    }
}

fn midpoint(min: i64, max: i64) -> i64 {
    let mid = (i128::from(min) + i128::from(max)).div_euclid(2);
    i64::try_from(mid).unwrap_or(min)
}

fn is_auto_exposure_name(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name.contains("exposure") && name.contains("auto")
}

/// UVC cameras expose automatic exposure as "Aperture Priority Mode".
fn is_auto_option(label: &str) -> bool {
    let label = label.to_ascii_lowercase();
    label.contains("auto") || label.contains("aperture priority")
}

/// A control that was discovered but could not be used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedControl {
    /// Control name.
    pub name: String,
    /// Why it was skipped.
    pub reason: String,
}

/// Outcome of applying defaults.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResetReport {
    /// Controls now at their default.
    pub applied: Vec<String>,
    /// Controls the device refused.
    pub skipped: Vec<SkippedControl>,
}

/// The set of controls discovered on the open device.
#[derive(Debug, Clone, Default)]
pub struct ControlRegistry {
    controls: Vec<Control>,
    unsupported: Vec<SkippedControl>,
}

impl ControlRegistry {
    /// Classify every descriptor. Unusable ones are recorded, not fatal.
    pub fn discover(descriptors: &[ControlDescriptor]) -> Self {
        let mut registry = Self::default();
        for desc in descriptors {
            if registry.get(&desc.name).is_some() {
                debug!(control = %desc.name, "duplicate control name ignored");
                continue;
            }
            match Control::from_descriptor(desc) {
                Ok(control) => registry.controls.push(control),
                Err(err) => {
                    warn!(control = %desc.name, error = %err, "control not registered");
                    registry.unsupported.push(SkippedControl {
                        name: desc.name.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        info!(
            controls = registry.controls.len(),
            unsupported = registry.unsupported.len(),
            "controls discovered"
        );
        registry
    }

    /// Query `device` and classify its controls.
    pub fn from_device(device: &dyn CameraDevice) -> Result<Self> {
        Ok(Self::discover(&device.controls()?))
    }

    /// Look up a control by name.
    pub fn get(&self, name: &str) -> Option<&Control> {
        self.controls.iter().find(|ctrl| ctrl.name == name)
    }

    /// All registered controls in discovery order.
    pub fn controls(&self) -> &[Control] {
        &self.controls
    }

    /// Controls that were discovered but not registered.
    pub fn unsupported(&self) -> &[SkippedControl] {
        &self.unsupported
    }

    /// Number of registered controls.
    pub fn len(&self) -> usize {
        self.controls.len()
    }

    /// Whether no controls are registered.
    pub fn is_empty(&self) -> bool {
        self.controls.is_empty()
    }

    /// Resolve `name` and check `value` against it.
    pub fn validate(&self, name: &str, value: i64) -> Result<&Control> {
        let control = self
            .get(name)
            .ok_or_else(|| CameraError::UnknownControl(name.to_owned()))?;
        control.validate(value)?;
        Ok(control)
    }

    /// Record a value the device accepted.
    pub fn record(&mut self, name: &str, value: i64) {
        if let Some(control) = self.controls.iter_mut().find(|ctrl| ctrl.name == name) {
            control.current = value;
        }
    }

    /// Computed defaults by name.
    pub fn defaults(&self) -> BTreeMap<String, i64> {
        self.controls
            .iter()
            .map(|ctrl| (ctrl.name.clone(), ctrl.default))
            .collect()
    }

    /// Current values by name.
    pub fn current_values(&self) -> BTreeMap<String, i64> {
        self.controls
            .iter()
            .map(|ctrl| (ctrl.name.clone(), ctrl.current))
            .collect()
    }

    /// Write every control's default to `device`.
    ///
    /// Refused controls are skipped with a warning; the rest are still
    /// applied.
    pub fn apply_defaults(&mut self, device: &mut dyn CameraDevice) -> ResetReport {
        let defaults = self.defaults();
        let report = self.apply_values(device, &defaults);
        info!(
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            "control defaults applied"
        );
        report
    }

    /// Write `values` to the matching controls on `device`.
    ///
    /// Auto-exposure menus go last so that exposure values are written while
    /// the device still accepts them. Unknown names and values outside the
    /// control's bounds are skipped, as are controls the device refuses.
    pub fn apply_values(
        &mut self,
        device: &mut dyn CameraDevice,
        values: &BTreeMap<String, i64>,
    ) -> ResetReport {
        let mut report = ResetReport::default();
        for name in values.keys().filter(|name| self.get(name).is_none()) {
            report.skipped.push(SkippedControl {
                name: name.clone(),
                reason: CameraError::UnknownControl(name.clone()).to_string(),
            });
        }

        let mut order: Vec<usize> = (0..self.controls.len()).collect();
        order.sort_by_key(|&idx| self.controls.get(idx).is_some_and(Control::is_auto_exposure));
        for idx in order {
            let Some(control) = self.controls.get_mut(idx) else {
                continue;
            };
            let Some(&value) = values.get(&control.name) else {
                continue;
            };
            match control
                .validate(value)
                .and_then(|()| device.set_control(control.id, value))
            {
                Ok(()) => {
                    control.current = value;
                    report.applied.push(control.name.clone());
                }
                Err(err) => {
                    warn!(control = %control.name, value, error = %err, "control value not applied");
                    report.skipped.push(SkippedControl {
                        name: control.name.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{boolean_control, integer_control, menu_control, MockCamera};
    use crate::traits::DeviceOpener;

    #[test]
    fn test_integer_default_is_floor_midpoint() {
        let cases = [(0, 255, 127), (0, 100, 50), (-5, 0, -3), (1, 2, 1), (7, 7, 7), (-10, 10, 0)];
        for (min, max, expected) in cases {
            let ctrl = Control::from_descriptor(&integer_control(1, "x", min, max, 1))
                .expect("valid control");
            assert_eq!(ctrl.default, expected, "midpoint of [{min}, {max}]");
        }
        assert_eq!(midpoint(i64::MIN, i64::MAX), -1);
    }

    #[test]
    fn test_boolean_defaults_off() {
        let ctrl = Control::from_descriptor(&boolean_control(1, "white_balance_automatic"))
            .expect("valid control");
        assert_eq!(ctrl.default, 0);
        assert_eq!(ctrl.current, 1);
    }

    #[test]
    fn test_menu_defaults() {
        let plain = Control::from_descriptor(&menu_control(
            1,
            "power_line_frequency",
            &[(0, "Disabled"), (1, "50 Hz")],
        ))
        .expect("valid control");
        assert_eq!(plain.default, 0);

        let auto = Control::from_descriptor(&menu_control(
            2,
            "auto_exposure",
            &[(0, "manual"), (1, "auto")],
        ))
        .expect("valid control");
        assert_eq!(auto.default, 1);

        let uvc = Control::from_descriptor(&menu_control(
            3,
            "auto_exposure",
            &[(1, "Manual Mode"), (3, "Aperture Priority Mode")],
        ))
        .expect("valid control");
        assert_eq!(uvc.default, 3);

        let no_auto = Control::from_descriptor(&menu_control(
            4,
            "exposure_auto",
            &[(1, "Manual Mode"), (2, "Shutter Priority Mode")],
        ))
        .expect("valid control");
        assert_eq!(no_auto.default, 1);
    }

    #[test]
    fn test_degenerate_controls_are_unsupported() {
        let inverted = integer_control(1, "zoom", 10, 5, 1);
        assert!(matches!(
            Control::from_descriptor(&inverted),
            Err(CameraError::UnsupportedProperty(_))
        ));

        let empty_menu = menu_control(2, "scene", &[]);
        let mut button = integer_control(3, "reset_pan", 0, 0, 0);
        button.kind = RawControlType::Other("button".to_owned());

        let registry = ControlRegistry::discover(&[
            inverted,
            empty_menu,
            button,
            integer_control(4, "gain", 0, 10, 1),
        ]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.unsupported().len(), 3);
        assert!(registry.get("zoom").is_none());
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let registry = ControlRegistry::discover(&[
            integer_control(1, "brightness", 0, 255, 1),
            menu_control(2, "auto_exposure", &[(1, "Manual Mode"), (3, "Aperture Priority Mode")]),
            boolean_control(3, "white_balance_automatic"),
        ]);

        assert!(registry.validate("brightness", 255).is_ok());
        assert!(matches!(
            registry.validate("brightness", 256),
            Err(CameraError::OutOfRange { min: 0, max: 255, .. })
        ));
        assert!(matches!(
            registry.validate("brightness", -1),
            Err(CameraError::OutOfRange { .. })
        ));
        assert!(registry.validate("auto_exposure", 3).is_ok());
        assert!(registry.validate("auto_exposure", 2).is_err());
        assert!(registry.validate("white_balance_automatic", 2).is_err());
        assert!(matches!(
            registry.validate("sharpness", 1),
            Err(CameraError::UnknownControl(_))
        ));
    }

    #[test]
    fn test_apply_defaults_skips_refused_controls() {
        let camera = MockCamera::new("mock://0");
        camera.reject_control("contrast");
        let mut device = camera.opener().open("mock://0").expect("open");

        let mut registry = ControlRegistry::from_device(device.as_ref()).expect("discover");
        let report = registry.apply_defaults(device.as_mut());

        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped.first().map(|s| s.name.as_str()), Some("contrast"));
        assert_eq!(report.applied.len(), registry.len() - 1);
        assert_eq!(report.applied.last().map(String::as_str), Some("auto_exposure"));

        assert_eq!(camera.control_value("brightness"), Some(127));
        assert_eq!(camera.control_value("auto_exposure"), Some(3));
        assert_eq!(camera.control_value("exposure_time_absolute"), Some(1025));
        assert_eq!(registry.get("brightness").map(|c| c.current), Some(127));
        assert_eq!(registry.get("brightness").and_then(|c| c.hardware_default), Some(128));
    }

    #[test]
    fn test_apply_values_carries_accepted_values() {
        let camera = MockCamera::new("mock://0");
        let mut device = camera.opener().open("mock://0").expect("open");
        let mut registry = ControlRegistry::from_device(device.as_ref()).expect("discover");
        assert!(!registry.is_empty());
        assert!(ControlRegistry::default().is_empty());

        let mut values = registry.current_values();
        values.insert("brightness".to_owned(), 42);
        values.insert("contrast".to_owned(), 1000);
        values.insert("sharpness".to_owned(), 1);

        let report = registry.apply_values(device.as_mut(), &values);
        let skipped: Vec<&str> = report.skipped.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(skipped, ["sharpness", "contrast"]);
        assert_eq!(camera.control_value("brightness"), Some(42));
        assert_eq!(registry.current_values().get("brightness"), Some(&42));
        assert_ne!(camera.control_value("contrast"), Some(1000));
    }
}
