use serial_test::serial;
use std::env;
use std::io::Write;
use tessel_webgpu::config::{
    ENV_CPU_FORWARD, ENV_CPU_HANDOFF_SIZE_THRESHOLD, ENV_DEFERRED_SUBMIT_BATCH_SIZE,
    ENV_POWER_PREFERENCE, ENV_USE_GLSL, ENV_WORKGROUP_SIZE,
};
use tessel_webgpu::{BackendConfig, PowerPreference, ShadingTarget};

const ALL_VARS: [&str; 6] = [
    ENV_DEFERRED_SUBMIT_BATCH_SIZE,
    ENV_CPU_FORWARD,
    ENV_CPU_HANDOFF_SIZE_THRESHOLD,
    ENV_USE_GLSL,
    ENV_POWER_PREFERENCE,
    ENV_WORKGROUP_SIZE,
];

struct EnvGuard;

impl EnvGuard {
    fn set(vars: &[(&str, &str)]) -> Self {
        clear();
        for (key, value) in vars {
            env::set_var(key, value);
        }
        EnvGuard
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        clear();
    }
}

fn clear() {
    for key in ALL_VARS {
        env::remove_var(key);
    }
}

#[test]
#[serial]
fn from_env_without_variables_is_default() {
    let _env = EnvGuard::set(&[]);
    assert_eq!(BackendConfig::from_env(), BackendConfig::default());
}

#[test]
#[serial]
fn process_environment_overrides_defaults() {
    let _env = EnvGuard::set(&[
        (ENV_DEFERRED_SUBMIT_BATCH_SIZE, "3"),
        (ENV_CPU_FORWARD, "off"),
        (ENV_CPU_HANDOFF_SIZE_THRESHOLD, "1024"),
        (ENV_USE_GLSL, "true"),
        (ENV_POWER_PREFERENCE, "low-power"),
        (ENV_WORKGROUP_SIZE, "16, 4"),
    ]);
    let config = BackendConfig::from_env();
    assert_eq!(config.deferred_submit_batch_size, 3);
    assert!(!config.cpu_forward);
    assert_eq!(config.cpu_handoff_size_threshold, 1024);
    assert_eq!(config.shading_language, ShadingTarget::Glsl);
    assert_eq!(config.power_preference, PowerPreference::LowPower);
    assert_eq!(config.workgroup_size, [16, 4, 1]);
}

#[test]
#[serial]
fn invalid_values_keep_the_previous_setting() {
    let _env = EnvGuard::set(&[
        (ENV_DEFERRED_SUBMIT_BATCH_SIZE, "-2"),
        (ENV_CPU_FORWARD, "maybe"),
        (ENV_POWER_PREFERENCE, "turbo"),
        (ENV_WORKGROUP_SIZE, "64,0"),
    ]);
    assert_eq!(BackendConfig::from_env(), BackendConfig::default());
}

#[test]
#[serial]
fn load_layers_environment_over_file() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    writeln!(
        file,
        r#"
deferred-submit-batch-size = 7
cpu-handoff-size-threshold = 32
shading-language = "glsl"
workgroup-size = [128, 1, 1]
"#
    )
    .expect("write");

    let _env = EnvGuard::set(&[(ENV_USE_GLSL, "0")]);
    let config = BackendConfig::load(file.path()).expect("load");
    assert_eq!(config.deferred_submit_batch_size, 7);
    assert_eq!(config.cpu_handoff_size_threshold, 32);
    assert_eq!(config.workgroup_size, [128, 1, 1]);
    // environment wins over the file
    assert_eq!(config.shading_language, ShadingTarget::Wgsl);
}

#[test]
#[serial]
fn load_reports_the_offending_path() {
    let _env = EnvGuard::set(&[]);
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("backend.toml");
    std::fs::write(&path, "deferred-submit-batch-size = \"many\"").expect("write");
    let err = BackendConfig::load(&path).unwrap_err();
    assert!(format!("{err:#}").contains("backend.toml"));

    let missing = dir.path().join("missing.toml");
    let err = BackendConfig::load(&missing).unwrap_err();
    assert!(err.to_string().contains("missing.toml"));
}
