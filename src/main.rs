use pingora::services::{background::background_service, listening::Service};
use pingora_core::server::{configuration::Opt, Server};

use scoutgate::{
    admin::AdminHttpApp,
    config::{Config, Scout},
    core::AppContext,
    gateway::StreamingGateway,
    logging::Logger,
    service::status::StatusHttpApp,
    session::SessionReaper,
};

fn main() {
    // Load configuration and command-line arguments
    let cli_options = Opt::parse_args();
    let config = match Config::load_yaml_with_opt_override(&cli_options) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Initialize logging
    let logger = if let Some(log_cfg) = &config.scout.log {
        let logger = Logger::new(log_cfg.clone());
        logger.init_env_logger();
        Some(logger)
    } else {
        env_logger::init();
        None
    };

    let ctx = AppContext::from_config(&config.scout);
    log::info!(
        "Loaded {} rate limit entries, cache ttl {}s",
        config.scout.rate_limits.len(),
        config.scout.cache.default_ttl
    );

    let mut scout_server = Server::new_with_opt_and_conf(Some(cli_options), config.pingora);

    if let Some(log_service) = logger {
        log::info!("Adding log sync service...");
        scout_server.add_service(log_service);
    }

    log::info!("Adding streaming gateway on {}...", config.scout.gateway.address);
    scout_server.add_service(background_service(
        "streaming gateway",
        StreamingGateway::from_config(&config.scout.gateway, ctx.clone()),
    ));

    log::info!("Adding session reaper...");
    scout_server.add_service(background_service(
        "session reaper",
        SessionReaper::from_config(ctx.bus.clone(), &config.scout.sessions),
    ));

    add_optional_services(&mut scout_server, &config.scout, &ctx);

    log::info!("Bootstrapping...");
    scout_server.bootstrap();

    log::info!("Starting Server...");
    scout_server.run_forever();
}

/// Add optional services (Admin, Status, Prometheus)
fn add_optional_services(server: &mut Server, cfg: &Scout, ctx: &AppContext) {
    if let Some(admin_cfg) = &cfg.admin {
        log::info!("Adding Admin HTTP...");
        server.add_service(AdminHttpApp::admin_http_service(admin_cfg, ctx.clone()));
    }

    if let Some(status_cfg) = &cfg.status {
        log::info!("Adding Status HTTP...");
        server.add_service(StatusHttpApp::status_http_service(status_cfg));
    }

    if let Some(prometheus_cfg) = &cfg.prometheus {
        log::info!("Adding Prometheus HTTP...");
        let mut prometheus_service_http = Service::prometheus_http_service();
        prometheus_service_http.add_tcp(&prometheus_cfg.address.to_string());
        server.add_service(prometheus_service_http);
    }
}
