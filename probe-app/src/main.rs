#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

use std::{
    fs::{self, File},
    path::PathBuf,
};

use clap::Parser;
use rgpu_provision::{
    catalog::Profile,
    config::ProvisionConfig,
    instance::{InstanceLoader, VulkanLogLevel},
    lifecycle::{Lifecycle, LifecycleError},
    select::{QueueRole, SelectionPolicy},
};
use tracing_subscriber::{
    Layer, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt,
};
use winit::{
    application::ApplicationHandler,
    dpi::LogicalSize,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window as WinitWindow, WindowAttributes, WindowId},
};

#[derive(
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Clone,
    Copy,
    Default,
    clap::ValueEnum,
)]
enum TracingLogLevel {
    Off,
    Trace,
    Info,
    Debug,
    Warn,
    #[default]
    Error,
}

impl From<TracingLogLevel> for tracing::Level {
    fn from(value: TracingLogLevel) -> Self {
        match value {
            //We clamp this to the lowest possible level but this shouldn't
            //happen
            TracingLogLevel::Off => tracing::Level::TRACE,
            TracingLogLevel::Trace => tracing::Level::TRACE,
            TracingLogLevel::Info => tracing::Level::INFO,
            TracingLogLevel::Debug => tracing::Level::DEBUG,
            TracingLogLevel::Warn => tracing::Level::WARN,
            TracingLogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum CliVulkanLogLevel {
    Verbose,
    Info,
    Warning,
    Error,
}

impl From<CliVulkanLogLevel> for VulkanLogLevel {
    fn from(value: CliVulkanLogLevel) -> Self {
        match value {
            CliVulkanLogLevel::Verbose => VulkanLogLevel::Verbose,
            CliVulkanLogLevel::Info => VulkanLogLevel::Info,
            CliVulkanLogLevel::Warning => VulkanLogLevel::Warning,
            CliVulkanLogLevel::Error => VulkanLogLevel::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum CliProfile {
    Debug,
    WindowedPresent,
    Mobile,
    Qualcomm,
    Spatial,
    RayTracing,
}

impl From<CliProfile> for Profile {
    fn from(value: CliProfile) -> Self {
        match value {
            CliProfile::Debug => Profile::Debug,
            CliProfile::WindowedPresent => Profile::WindowedPresent,
            CliProfile::Mobile => Profile::Mobile,
            CliProfile::Qualcomm => Profile::Qualcomm,
            CliProfile::Spatial => Profile::Spatial,
            CliProfile::RayTracing => Profile::RayTracing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum CliSelectionPolicy {
    CombinedDiscrete,
    PreferDiscrete,
}

impl From<CliSelectionPolicy> for SelectionPolicy {
    fn from(value: CliSelectionPolicy) -> Self {
        match value {
            CliSelectionPolicy::CombinedDiscrete => {
                SelectionPolicy::CombinedDiscrete
            }
            CliSelectionPolicy::PreferDiscrete => {
                SelectionPolicy::PreferDiscrete
            }
        }
    }
}

/// Negotiate and provision a Vulkan device, print what was chosen, then
/// tear everything down.
#[derive(clap::Parser, Debug)]
struct CliArgs {
    #[arg(short, long, default_value = "error")]
    tracing_log_level: TracingLogLevel,
    #[arg(short, long)]
    graphics_debug_level: Option<CliVulkanLogLevel>,
    /// TOML file with provisioning settings; flags override it.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Capability profiles, replacing the configured set.
    #[arg(short, long, value_delimiter = ',')]
    profile: Vec<CliProfile>,
    #[arg(long)]
    selection_policy: Option<CliSelectionPolicy>,
    /// Provision without a window or surface.
    #[arg(long)]
    headless: bool,
}

impl CliArgs {
    fn provision_config(&self) -> eyre::Result<ProvisionConfig> {
        let mut config = match &self.config {
            Some(path) => ProvisionConfig::from_path(path)?,
            None => ProvisionConfig {
                app_name: "probe-app".to_owned(),
                ..ProvisionConfig::default()
            },
        };
        if !self.profile.is_empty() {
            config.profiles =
                self.profile.iter().map(|&p| Profile::from(p)).collect();
        }
        if self.headless {
            config.profiles = config.profiles.without(Profile::WindowedPresent);
        }
        if let Some(level) = self.graphics_debug_level {
            config.debug_level = Some(level.into());
        }
        if let Some(policy) = self.selection_policy {
            config.selection_policy = policy.into();
        }
        Ok(config)
    }
}

fn main() -> eyre::Result<()> {
    let app_dirs =
        directories::ProjectDirs::from("", "rgpu-provision", "probe-app");

    let log_dir = match app_dirs
        .as_ref()
        .and_then(|x| x.runtime_dir().or_else(|| Some(x.data_dir())))
        .map(|p| p.to_owned())
    {
        Some(path) => path,
        None => std::env::current_dir()?,
    };

    let cli_args = CliArgs::parse();

    if cli_args.tracing_log_level != TracingLogLevel::Off {
        fs::create_dir_all(&log_dir)?;

        let mut log_file_path = log_dir.clone();
        log_file_path.push("log-file");
        log_file_path.set_extension("txt");
        let log_file = File::create(&log_file_path)?;
        let file_log = tracing_subscriber::fmt::layer()
            .with_writer(log_file)
            .with_ansi(false);

        println!("log_file_path: {}", log_file_path.display());
        println!("cli_args: {:#?}", cli_args);

        let stdout_log = tracing_subscriber::fmt::layer().pretty();

        tracing_subscriber::registry()
            .with(
                stdout_log
                    .with_filter(LevelFilter::from_level(
                        cli_args.tracing_log_level.into(),
                    ))
                    .and_then(file_log),
            )
            .init();
    }

    let config = cli_args.provision_config()?;
    tracing::debug!("Provisioning with {config:#?}");

    if cli_args.headless {
        //SAFETY: Loads vulkan via libloading which is kinda unsafe but
        //we're fine
        let loader = unsafe { InstanceLoader::headless() }?;
        let mut lifecycle = Lifecycle::new(loader, config);
        lifecycle.initialize()?;
        lifecycle.create_headless_device()?;
        print_summary(&lifecycle);
        lifecycle.terminate();
        return Ok(());
    }

    let event_loop = EventLoop::builder().build()?;

    //SAFETY: Loads vulkan via libloading which is kinda unsafe but we're fine
    let loader = unsafe { InstanceLoader::new(Some(&event_loop)) }?;
    let mut lifecycle = Lifecycle::new(loader, config);
    lifecycle.initialize()?;

    let mut app = ProbeRunner {
        lifecycle,
        outcome: None,
    };
    tracing::trace!("Entering main event loop");
    event_loop.run_app(&mut app)?;

    match app.outcome {
        Some(Ok(())) => Ok(()),
        Some(Err(e)) => Err(e.into()),
        None => Err(eyre::eyre!(
            "Event loop exited before a window was created"
        )),
    }
}

fn print_summary(lifecycle: &Lifecycle<InstanceLoader>) {
    let (Some(selection), Some(negotiation), Some(device)) = (
        lifecycle.selection(),
        lifecycle.negotiation(),
        lifecycle.device(),
    ) else {
        return;
    };

    println!(
        "device: {} ({:?}, api {})",
        selection.candidate.name,
        selection.candidate.device_type,
        selection.candidate.api_version
    );
    println!("selection rule: {:?}", selection.tier);
    for role in QueueRole::ALL {
        let family = device
            .roles()
            .get(role)
            .and_then(|index| selection.candidate.queue_family(index));
        match family {
            Some(family) => println!("  {role} queue family: {family}"),
            None => println!("  {role} queue family: unassigned"),
        }
    }
    println!("command pools: {}", device.pools().unique_handles().len());
    println!("enabled:");
    for entry in &negotiation.satisfied {
        println!("  {entry}");
    }
    if !negotiation.optional_missing.is_empty() {
        println!("dropped optional:");
        for entry in &negotiation.optional_missing {
            println!("  {entry}");
        }
    }
}

struct ProbeRunner {
    lifecycle: Lifecycle<InstanceLoader>,
    outcome: Option<Result<(), LifecycleError>>,
}

impl ApplicationHandler for ProbeRunner {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.outcome.is_some() {
            return;
        }
        let win: WinitWindow = match event_loop.create_window(
            WindowAttributes::default()
                .with_title("probe-app")
                .with_inner_size(LogicalSize {
                    width: 640,
                    height: 360,
                }),
        ) {
            Ok(w) => w,
            Err(e) => {
                tracing::error!("Error while creating window: {}", e);
                event_loop.exit();
                return;
            }
        };

        //SAFETY: the lifecycle is terminated below, before win is dropped
        let result = unsafe { self.lifecycle.create_surface_and_device(&win) };
        match &result {
            Ok(()) => print_summary(&self.lifecycle),
            Err(e) => tracing::error!("Error while provisioning device: {}", e),
        }
        self.lifecycle.terminate();
        drop(win);

        self.outcome = Some(result);
        event_loop.exit();
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: WindowId,
        window_event: WindowEvent,
    ) {
        if matches!(window_event, WindowEvent::CloseRequested) {
            tracing::trace!("Close window request received for window");
            event_loop.exit();
        }
    }
}
