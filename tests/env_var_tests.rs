//! Tests that verify what a supervised process sees: its environment,
//! its arguments, and its working directory.

use indoc::indoc;
use pretty_assertions::assert_eq;
use relaunch::{
    config::Config,
    policy::{RestartMode, RestartPolicy},
    supervisor::ProcessState,
    AppConfig, Supervisor,
};

use crate::common::{fast_policy, setup, wait_for_state, TestDir};

mod common;

/// Runs `config` once (restarts disabled) and returns the results file.
async fn run_once(dir: &TestDir, config: AppConfig) -> String {
    let supervisor = Supervisor::new();
    supervisor
        .start(AppConfig {
            policy: RestartPolicy {
                mode: RestartMode::Never,
                ..config.policy
            },
            ..config
        })
        .await
        .unwrap();

    wait_for_state(&supervisor, ProcessState::Stopped).await;
    supervisor.stop().await.unwrap();

    dir.results().await
}

/// Only PATH is inherited from the supervisor; everything else comes
/// from the app's configured environment.
#[test_log::test(tokio::test)]
async fn only_path_and_configured_env_reach_the_process() {
    std::env::set_var("RELAUNCH_TEST_NOT_PASSED", "leaked");

    let dir = setup().await;
    let mut config = dir.shell_app(
        "env",
        r#"echo "$PATH|$MACHINE|$RELAUNCH_TEST_NOT_PASSED" >> {result_path}"#,
    );
    config
        .env
        .insert(String::from("MACHINE"), String::from("development"));

    let output = run_once(&dir, config).await;

    assert_eq!(
        format!("{}|development|\n", std::env::var("PATH").unwrap()),
        output
    );
}

/// Configured variables win over the inherited base set.
#[test_log::test(tokio::test)]
async fn configured_env_overrides_inherited_path() {
    let dir = setup().await;
    let mut config = AppConfig {
        args: vec![
            String::from("-c"),
            format!(r#"echo "$PATH" >> {}"#, dir.results_path.display()),
        ],
        policy: fast_policy(),
        ..AppConfig::new("env", "/bin/sh", dir.path())
    };
    config
        .env
        .insert(String::from("PATH"), String::from("/opt/app/bin"));

    assert_eq!("/opt/app/bin\n", run_once(&dir, config).await);
}

/// The environment profile chosen at load time decides both the
/// environment and any `{{VAR}}` templates in the arguments.
#[test_log::test(tokio::test)]
async fn environment_profile_from_config_file() {
    let config = r##"
        [[apps]]
        name = "webhook"
        script = "/bin/sh"
        cwd = "{temp_path}"
        args = [ "-c", "echo \"$MACHINE $*\" >> {result_path}", "webhook", "-hooks", "hooks-{{MACHINE}}.json", "-verbose" ]

        [apps.env]
        MACHINE = "development"

        [apps.env-profile.production]
        MACHINE = "production"
        "##;

    for (profile, expected) in [
        (
            None,
            indoc! {r#"
                development -hooks hooks-development.json -verbose
            "#},
        ),
        (
            Some("production"),
            indoc! {r#"
                production -hooks hooks-production.json -verbose
            "#},
        ),
    ] {
        let dir = setup().await;
        let config: Config = toml::from_str(
            &config
                .replace("{result_path}", dir.results_path.to_str().unwrap())
                .replace("{temp_path}", dir.path().to_str().unwrap()),
        )
        .unwrap();

        let mut apps = config.resolve(profile).unwrap();
        assert_eq!(1, apps.len());

        let output = run_once(&dir, apps.remove(0)).await;
        assert_eq!(expected, output);
    }
}

/// The process runs in its configured working directory.
#[test_log::test(tokio::test)]
async fn runs_in_configured_working_directory() {
    let dir = setup().await;
    let output = run_once(&dir, dir.shell_app("pwd", "pwd >> {result_path}")).await;

    assert_eq!(
        dir.path().canonicalize().unwrap().to_str().unwrap(),
        output.trim_end()
    );
}
