//! The single entry point: context construction, rate-limit gate, handler
//! dispatch, exit-code mapping, and signal-driven cancellation.

use serde_json::json;
use tracing::{debug, warn};

use mc_audit::AuditCategory;
use mc_core::logging::{flush_output_streams, init_logging, LogFormat};
use mc_core::{
    current_unix_timestamp_ms, set_current_correlation_id, CorrelationId, ExitCode, OpsError,
    StateStore,
};

use crate::cli_args::{
    AuditAction, Cli, CircuitsAction, Command, ConfigAction, EventsAction, RateLimitAction,
};
use crate::context::{env_debug, env_json_output, AppHandles, CommandContext, OutputMode};
use crate::output::{render_error, render_success, CommandReport};
use crate::{config_cmds, events, exec, heal, prune, status_cmds, substrate_cmds};

/// Runs one parsed invocation to completion and returns its exit code.
///
/// Every path out of this function has already flushed logs and pending
/// writes; the caller only converts the code into `process::exit`.
pub async fn run(cli: Cli) -> ExitCode {
    let output_mode = if cli.json || env_json_output() {
        OutputMode::Json
    } else {
        OutputMode::Human
    };
    let debug_enabled = cli.debug || env_debug();
    init_logging(debug_enabled, match output_mode {
        OutputMode::Json => LogFormat::Json,
        OutputMode::Human => LogFormat::Compact,
    });

    let correlation_id = CorrelationId::resolve_or_generate();
    set_current_correlation_id(correlation_id.clone());

    let state_dir = cli
        .state_dir
        .clone()
        .unwrap_or_else(StateStore::default_root);
    let handles = match AppHandles::open(&state_dir) {
        Ok(handles) => handles,
        Err(error) => {
            let error = OpsError::Generic(error);
            render_error(&error, &correlation_id, output_mode);
            flush_output_streams();
            return error.exit_code();
        }
    };

    let context = CommandContext {
        correlation_id: correlation_id.clone(),
        user_identity: mc_core::user_identity(),
        started_at_ms: current_unix_timestamp_ms(),
        command_path: cli.command.path_tokens(),
        output_mode,
        quiet: cli.quiet,
        debug_enabled,
        state_dir,
    };

    debug!(
        correlation_id = %context.correlation_id,
        command = %context.command_path.join(" "),
        "dispatching command"
    );

    let outcome = dispatch(&cli.command, &context, &handles).await;
    let code = match outcome {
        Ok(report) => {
            render_success(&report, output_mode, cli.quiet);
            ExitCode::Ok
        }
        Err(error) => {
            render_error(&error, &correlation_id, output_mode);
            error.exit_code()
        }
    };
    flush_output_streams();
    code
}

/// Rate-limit gate, audit trail, then the cancellable handler.
async fn dispatch(
    command: &Command,
    context: &CommandContext,
    handles: &AppHandles,
) -> Result<CommandReport, OpsError> {
    let category = command.category();
    let admission = handles
        .limiter
        .admit(&context.user_identity, category, current_unix_timestamp_ms())
        .map_err(OpsError::Generic)?;
    if let Err(denied) = admission {
        handles
            .audit
            .append(
                AuditCategory::RateLimitDenied,
                category,
                json!({ "retry_after_ms": denied.retry_after_ms }),
            )
            .map_err(OpsError::Generic)?;
        return Err(OpsError::RateLimited {
            category: denied.category,
            retry_after_ms: denied.retry_after_ms,
        });
    }

    handles
        .audit
        .append(
            AuditCategory::CommandExec,
            &context.command_path.join(" "),
            json!({ "category": category }),
        )
        .map_err(OpsError::Generic)?;

    tokio::select! {
        result = handle(command, context, handles) => result,
        _ = cancellation_signal() => {
            warn!(command = %context.command_path.join(" "), "command cancelled by signal");
            Err(OpsError::Cancelled)
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn cancellation_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(_) => return std::future::pending().await,
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn handle(
    command: &Command,
    context: &CommandContext,
    handles: &AppHandles,
) -> Result<CommandReport, OpsError> {
    match command {
        Command::Status => {
            let config = config_cmds::load_config(&handles.store, &handles.audit)?;
            status_cmds::handle_status(context, handles, status_cmds::gateway_config_from(&config))
                .await
        }
        Command::Health => {
            let config = config_cmds::load_config(&handles.store, &handles.audit)?;
            status_cmds::handle_health(handles, status_cmds::gateway_config_from(&config)).await
        }
        Command::Config { action } => match action {
            ConfigAction::Get { key } => config_cmds::config_get(&handles.store, &handles.audit, key),
            ConfigAction::Set { key, value } => {
                config_cmds::config_set(&handles.store, &handles.audit, key, value)
            }
            ConfigAction::List => config_cmds::config_list(&handles.store, &handles.audit),
            ConfigAction::Fix => config_cmds::config_fix(&handles.store, &handles.audit),
        },
        Command::Exec {
            container,
            command,
            shell,
            timeout_ms,
            no_limits,
        } => {
            let request = exec::ExecRequest {
                container: container.clone(),
                command: command.clone(),
                shell: *shell,
                timeout_ms: *timeout_ms,
                resource_limits: !no_limits,
            };
            exec::run_exec(&request, &handles.audit).await
        }
        Command::Heal { apply, force } => handle_heal(context, handles, *apply, *force).await,
        Command::Prune { apply, force } => handle_prune(handles, *apply, *force).await,
        Command::Events { action } => match action {
            EventsAction::List { limit, unacked } => Ok(events::list_report(
                &events::list_events(&handles.store, *limit, *unacked),
            )),
            EventsAction::Add {
                title,
                severity,
                message,
            } => {
                let event = events::record_event(
                    &handles.store,
                    severity,
                    title,
                    message,
                    "cli",
                    serde_json::Value::Null,
                )?;
                Ok(CommandReport::new(
                    format!("recorded {}", event.id),
                    serde_json::to_value(&event).unwrap_or_default(),
                ))
            }
            EventsAction::Ack { id } => {
                let event = events::acknowledge_event(&handles.store, id)?;
                Ok(CommandReport::new(
                    format!("acknowledged {}", event.id),
                    serde_json::to_value(&event).unwrap_or_default(),
                ))
            }
        },
        Command::Audit { action } => match action {
            AuditAction::Verify => substrate_cmds::handle_audit_verify(handles),
            AuditAction::Tail { count } => substrate_cmds::handle_audit_tail(handles, *count),
        },
        Command::RateLimit { action } => match action {
            RateLimitAction::Status => substrate_cmds::handle_rate_limit_status(context, handles),
            RateLimitAction::Reset { category, force } => substrate_cmds::handle_rate_limit_reset(
                context,
                handles,
                category.as_deref(),
                *force,
            ),
        },
        Command::Circuits { action } => match action {
            CircuitsAction::Status => substrate_cmds::handle_circuits_status(handles),
            CircuitsAction::Reset { name, force } => {
                substrate_cmds::handle_circuits_reset(handles, name, *force)
            }
        },
        Command::Logs { service, tail } => substrate_cmds::handle_logs(service, *tail).await,
    }
}

async fn handle_heal(
    context: &CommandContext,
    handles: &AppHandles,
    apply: bool,
    force: bool,
) -> Result<CommandReport, OpsError> {
    let config = config_cmds::load_config(&handles.store, &handles.audit)?;
    let protected = heal::protected_prefixes(&config);
    let observations = heal::gather_observations(
        &handles.store,
        &handles.breakers,
        status_cmds::gateway_config_from(&config),
        &protected,
    )
    .await;
    let plan = heal::plan(heal::scan(&observations));

    if !apply {
        return Ok(heal::plan_report(&plan));
    }
    if !force {
        return Err(OpsError::Usage(
            "'heal --apply' is destructive; pass --force to confirm".to_string(),
        ));
    }

    let applied = heal::apply(&plan, &handles.breakers).await?;
    events::record_event(
        &handles.store,
        "info",
        "heal apply completed",
        &format!("{} action(s) attempted", applied.len()),
        "heal",
        json!({ "correlation_id": context.correlation_id.as_str() }),
    )?;
    Ok(heal::apply_report(&applied))
}

async fn handle_prune(
    handles: &AppHandles,
    apply: bool,
    force: bool,
) -> Result<CommandReport, OpsError> {
    let config = config_cmds::load_config(&handles.store, &handles.audit)?;
    let protected = heal::protected_prefixes(&config);
    let survey = prune::survey(&protected).await?;

    if !apply {
        return Ok(prune::survey_report(&survey));
    }
    if !force {
        return Err(OpsError::Usage(
            "'prune --apply' is destructive; pass --force to confirm".to_string(),
        ));
    }

    let (removed, failed) = prune::apply(&survey).await?;
    Ok(prune::apply_report(&removed, &failed, &survey.protected))
}
