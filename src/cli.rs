// Interactive client commands
// Drive the SSO flows against a running Bridge API from the terminal

use anyhow::{Context, Result};
use dialoguer::{Confirm, Input, Select};
use std::sync::Arc;

use crate::client::SsoApi;
use crate::flows::{
    CompletionOutcome, ContextPicker, DeviceAuthFlow, FlowError, MappingStatus, MappingTarget,
    SessionForm, SyncCoordinator, SyncOutcome,
};
use crate::models::{DeviceAuthSession, SsoSession};

const REGIONS: &[&str] = &[
    "us-east-1",
    "us-east-2",
    "us-west-2",
    "eu-west-1",
    "eu-central-1",
    "ap-southeast-1",
    "ap-northeast-1",
];

/// `login` - add a session through device authorization
pub async fn login(api: Arc<dyn SsoApi>) -> Result<()> {
    let mut flow = DeviceAuthFlow::new(api);

    loop {
        let form = prompt_form()?;
        match flow.submit(form).await {
            Ok(_) => break,
            Err(FlowError::Validation(msg)) => {
                eprintln!("❌ {}", msg);
            }
            Err(e) => return Err(e.into()),
        }
    }

    match complete_in_browser(&mut flow).await? {
        Some(session) => {
            println!("✅ Logged in as session '{}'", session.name);
            print_session(&session);
        }
        None => println!("Login cancelled"),
    }
    Ok(())
}

fn prompt_form() -> Result<SessionForm> {
    let name: String = Input::new()
        .with_prompt("Session name")
        .interact_text()
        .context("Failed to read session name")?;

    let start_url: String = Input::new()
        .with_prompt("SSO start URL")
        .interact_text()
        .context("Failed to read start URL")?;

    let region_idx = Select::new()
        .with_prompt("SSO region")
        .items(REGIONS)
        .default(0)
        .interact()
        .context("Failed to read region selection")?;

    Ok(SessionForm::new(name, start_url, REGIONS[region_idx]))
}

fn print_device(device: &DeviceAuthSession) {
    println!();
    println!("  Open:  {}", device.verification_uri_complete);
    println!("  Code:  {}", device.user_code);
    println!(
        "  The code expires in {} minutes.",
        (device.expires_in / 60).max(1)
    );
    println!();
}

/// Code step: wait for the user to finish the browser login, completing once
/// per confirmation. `None` when the user gives up.
async fn complete_in_browser(flow: &mut DeviceAuthFlow) -> Result<Option<SsoSession>> {
    if let Some(device) = flow.device() {
        print_device(device);
    }

    loop {
        let done = Confirm::new()
            .with_prompt("I've completed the login in my browser")
            .default(true)
            .interact()
            .context("Failed to read confirmation")?;
        if !done {
            return Ok(None);
        }

        match flow.complete().await? {
            CompletionOutcome::Completed(session) => return Ok(Some(session)),
            CompletionOutcome::LoginPending(msg) => println!("⏳ {}", msg),
            CompletionOutcome::Failed(e) => eprintln!("❌ {}", e.user_message()),
        }
    }
}

/// `sessions` - list sessions with their account tree
pub async fn sessions(api: Arc<dyn SsoApi>) -> Result<()> {
    let sessions = api.list_sessions().await?;
    if sessions.is_empty() {
        println!("No SSO sessions. Run `bridge-sso login` to add one.");
        return Ok(());
    }
    for session in &sessions {
        print_session(session);
    }
    Ok(())
}

fn print_session(session: &SsoSession) {
    let status = if session.is_logged_in {
        "logged in"
    } else {
        "logged out"
    };
    println!(
        "{} ({}, {}) [{}]",
        session.name, session.start_url, session.region, status
    );
    if let Some(synced) = session.last_synced {
        println!("  last synced {}", synced.to_rfc3339());
    }
    for account in &session.accounts {
        println!("  {} ({})", account.account_name, account.account_id);
        for role in &account.roles {
            println!("    - {}", role);
        }
    }
}

/// `sync` - sync a session, re-authenticating once if the backend asks for it
pub async fn sync(api: Arc<dyn SsoApi>, name: &str) -> Result<()> {
    let session = api.get_session(name).await?;
    let mut coordinator = SyncCoordinator::new(api.clone());

    let outcome = match coordinator.sync(&session).await? {
        SyncOutcome::ReauthRequired(target) => {
            println!("🔐 Session '{}' needs a fresh SSO login", name);

            let mut flow = match DeviceAuthFlow::reauth(api.clone(), &target).await {
                Ok(flow) => flow,
                Err(e) => {
                    coordinator.reauth_dismissed(name);
                    return Err(e.into());
                }
            };

            match complete_in_browser(&mut flow).await {
                Ok(Some(_)) => coordinator.reauth_completed(name).await?,
                Ok(None) => {
                    coordinator.reauth_dismissed(name);
                    println!("Sync cancelled");
                    return Ok(());
                }
                Err(e) => {
                    coordinator.reauth_dismissed(name);
                    return Err(e);
                }
            }
        }
        other => other,
    };

    match outcome {
        SyncOutcome::Synced(session) => {
            println!("✅ Synced {} accounts", session.accounts.len());
            print_session(&session);
            Ok(())
        }
        SyncOutcome::Failed(e) => anyhow::bail!("Sync failed: {}", e.user_message()),
        SyncOutcome::ReauthRequired(_) => anyhow::bail!("Sync failed: SSO login still required"),
    }
}

/// `map` - bind a Kubernetes context to an account role of a session
pub async fn map(api: Arc<dyn SsoApi>, session_name: &str, query: Option<String>) -> Result<()> {
    let session = api.get_session(session_name).await?;
    if session.accounts.is_empty() {
        anyhow::bail!(
            "Session '{}' has no accounts; run `bridge-sso sync {}` first",
            session_name,
            session_name
        );
    }

    let account_labels: Vec<String> = session
        .accounts
        .iter()
        .map(|a| format!("{} ({})", a.account_name, a.account_id))
        .collect();
    let account_idx = Select::new()
        .with_prompt("Account")
        .items(&account_labels)
        .default(0)
        .interact()
        .context("Failed to read account selection")?;
    let account = &session.accounts[account_idx];

    if account.roles.is_empty() {
        anyhow::bail!("Account {} has no roles", account.account_id);
    }
    let role_idx = Select::new()
        .with_prompt("Role")
        .items(&account.roles)
        .default(0)
        .interact()
        .context("Failed to read role selection")?;

    let target = MappingTarget {
        session_name: session.name.clone(),
        account_id: account.account_id.clone(),
        account_name: Some(account.account_name.clone()),
        role_name: account.roles[role_idx].clone(),
    };
    let picker = ContextPicker::load(api, target).await?;

    let query = match query {
        Some(q) => q,
        None => Input::new()
            .with_prompt("Search contexts")
            .allow_empty(true)
            .interact_text()
            .context("Failed to read search query")?,
    };

    let candidates = picker.search(&query);
    if candidates.is_empty() {
        anyhow::bail!("No Kubernetes context matches '{}'", query);
    }

    let labels: Vec<String> = candidates
        .iter()
        .map(|c| {
            let marker = match &c.status {
                MappingStatus::Unmapped => String::new(),
                MappingStatus::MappedToTarget => "  [mapped here]".to_string(),
                MappingStatus::MappedElsewhere(m) => {
                    format!("  [mapped to {}/{}]", m.account_id, m.role_name)
                }
            };
            format!("{} ({}){}", c.context.name, c.context.cluster, marker)
        })
        .collect();
    let idx = Select::new()
        .with_prompt("Context")
        .items(&labels)
        .default(0)
        .interact()
        .context("Failed to read context selection")?;
    let candidate = &candidates[idx];

    if let MappingStatus::MappedElsewhere(previous) = &candidate.status {
        let overwrite = Confirm::new()
            .with_prompt(format!(
                "'{}' is mapped to {}/{}. Overwrite?",
                candidate.context.name, previous.account_id, previous.role_name
            ))
            .default(false)
            .interact()
            .context("Failed to read confirmation")?;
        if !overwrite {
            println!("Mapping unchanged");
            return Ok(());
        }
    }

    let mapping = picker.confirm(&candidate.context.name).await?;
    println!(
        "✅ {} → {}/{} ({})",
        mapping.context_name, mapping.account_id, mapping.role_name, mapping.session_name
    );
    Ok(())
}

/// `unmap` - remove the mapping of a context
pub async fn unmap(api: Arc<dyn SsoApi>, context: &str) -> Result<()> {
    api.delete_mapping(context).await?;
    println!("✅ Removed mapping for '{}'", context);
    Ok(())
}

/// `mappings` - list context mappings
pub async fn mappings(api: Arc<dyn SsoApi>) -> Result<()> {
    let mappings = api.list_mappings().await?;
    if mappings.is_empty() {
        println!("No context mappings.");
        return Ok(());
    }
    for m in &mappings {
        println!(
            "{:<30} {}/{} ({}{})",
            m.context_name,
            m.account_name.as_deref().unwrap_or(&m.account_id),
            m.role_name,
            m.session_name,
            if m.account_name.is_some() {
                format!(", {}", m.account_id)
            } else {
                String::new()
            }
        );
    }
    Ok(())
}

/// `status` - login status for a start URL
pub async fn status(api: Arc<dyn SsoApi>, start_url: &str) -> Result<()> {
    let status = api.device_status(start_url).await?;
    match (&status.session_name, status.is_logged_in) {
        (Some(name), true) => println!(
            "✅ Logged in via session '{}'{}",
            name,
            status
                .token_expiry
                .map(|e| format!(" until {}", e.to_rfc3339()))
                .unwrap_or_default()
        ),
        (Some(name), false) => println!("⚠️  Session '{}' is logged out", name),
        (None, _) => println!("No session for {}", status.start_url),
    }
    Ok(())
}
