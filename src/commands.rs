use crate::registers::RegisterIndex;

/// Resolve configured parameter names against the register table, failing on
/// the first unknown one. An empty list selects every known register.
fn resolve_parameters(names: &[String]) -> Result<Vec<RegisterIndex>, String> {
    if names.is_empty() {
        return Ok(RegisterIndex::all().collect());
    }
    names
        .iter()
        .map(|name| RegisterIndex::from_name(name).ok_or_else(|| name.clone()))
        .collect()
}

pub mod registers {
    use crate::output;
    use crate::registers::RegisterIndex;

    /// Search and output the known Multical 402 registers.
    #[derive(clap::Parser)]
    pub struct Args {
        /// Only show registers whose name, address or description contains
        /// this string.
        filter: Option<String>,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not produce output")]
        Output(#[source] crate::output::Error),
    }

    #[derive(serde::Serialize)]
    pub struct RegisterSchema {
        pub address: u16,
        pub name: &'static str,
        pub description: &'static str,
    }

    impl RegisterSchema {
        pub fn all_registers() -> impl Iterator<Item = Self> {
            RegisterIndex::all().map(|register| RegisterSchema {
                address: register.address(),
                name: register.name(),
                description: register.description(),
            })
        }

        pub fn is_match(&self, pattern: &str) -> bool {
            let pattern = pattern.to_lowercase();
            if self.name.contains(&pattern) {
                return true;
            }
            if self.description.to_lowercase().contains(&pattern) {
                return true;
            }
            if format!("{:#06x}", self.address).contains(&pattern) {
                return true;
            }
            self.address.to_string().contains(&pattern)
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let mut sink = args.output.to_sink().map_err(Error::Output)?;
        sink.headers(vec!["Address", "Name", "Description"]).map_err(Error::Output)?;
        for register in RegisterSchema::all_registers() {
            if let Some(pattern) = &args.filter {
                if !register.is_match(pattern) {
                    continue;
                }
            }
            sink.record(
                || {
                    vec![
                        format!("{:#06x}", register.address),
                        register.name.to_string(),
                        register.description.to_string(),
                    ]
                },
                || &register,
            )
            .map_err(Error::Output)?;
        }
        sink.finish().map_err(Error::Output)
    }

}

pub mod read {
    use crate::connection::{self, Connection};
    use crate::output;

    /// Run one read cycle against the meter and print the decoded values.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        output: output::Args,
        /// The register names to read. All known registers when empty.
        parameters: Vec<String>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("unknown parameter `{0}` (see the `registers` command for valid names)")]
        UnknownParameter(String),
        #[error("could not start the async runtime")]
        CreateRuntime(#[source] std::io::Error),
        #[error("could not communicate with the meter")]
        Connection(#[source] connection::Error),
        #[error("could not produce output")]
        Output(#[source] crate::output::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let parameters =
            super::resolve_parameters(&args.parameters).map_err(Error::UnknownParameter)?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(Error::CreateRuntime)?;
        let connection = Connection::new(args.connection);
        let values =
            runtime.block_on(connection.read_cycle(&parameters)).map_err(Error::Connection)?;
        let mut sink = args.output.to_sink().map_err(Error::Output)?;
        sink.headers(vec!["Parameter", "Value"]).map_err(Error::Output)?;
        for (name, value) in &values {
            sink.record(
                || vec![name.to_string(), format!("{value:.2}")],
                || serde_json::json!({ "parameter": name, "value": value }),
            )
            .map_err(Error::Output)?;
        }
        sink.finish().map_err(Error::Output)
    }
}

pub mod serve {
    use crate::connection::{self, Connection};
    use crate::registers::RegisterIndex;
    use rumqttc::v5::mqttbytes::QoS;
    use std::time::Duration;
    use tracing::{info, trace, warn};

    /// Periodically read out the meter and publish the values over MQTT.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,

        /// Hostname of the MQTT broker to publish to.
        #[arg(long)]
        host: String,

        /// Port of the MQTT broker.
        #[arg(long, default_value = "1883")]
        port: u16,

        /// Client identifier to connect to the broker with.
        #[arg(long, default_value = "kamstrup-meter")]
        client_id: String,

        /// Username to authenticate to the broker with.
        #[arg(long, requires = "password")]
        username: Option<String>,

        /// Password to authenticate to the broker with.
        #[arg(long, requires = "username")]
        password: Option<String>,

        /// Topic prefix to publish under. Value sets go to `<topic>/values`.
        #[arg(long, default_value = "kamstrup")]
        topic: String,

        /// Quality of service for published messages (0, 1 or 2).
        #[arg(long, default_value = "0")]
        qos: u8,

        /// Ask the broker to retain the last published value set.
        #[arg(long)]
        retain: bool,

        /// How long to wait between read cycles.
        ///
        /// The meter puts its interface into standby when left alone for
        /// about half an hour, so intervals above 30 minutes may find it
        /// asleep.
        #[arg(long, default_value = "28m")]
        interval: humantime::Duration,

        /// The register names to publish. All known registers when empty.
        parameters: Vec<String>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("unknown parameter `{0}` (see the `registers` command for valid names)")]
        UnknownParameter(String),
        #[error("poll interval {0} is shorter than one minute")]
        IntervalTooShort(humantime::Duration),
        #[error("`--qos` must be 0, 1 or 2, not {0}")]
        InvalidQos(u8),
        #[error("could not start the async runtime")]
        CreateRuntime(#[source] std::io::Error),
        #[error("could not serialize the value set")]
        Serialize(#[source] serde_json::Error),
        #[error("could not schedule an MQTT publish")]
        Publish(#[source] rumqttc::v5::ClientError),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let parameters =
            super::resolve_parameters(&args.parameters).map_err(Error::UnknownParameter)?;
        if *args.interval < Duration::from_secs(60) {
            return Err(Error::IntervalTooShort(args.interval));
        }
        if *args.interval > Duration::from_secs(30 * 60) {
            warn!("poll intervals above 30 minutes may let the meter fall into standby");
        }
        let qos = match args.qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            other => return Err(Error::InvalidQos(other)),
        };
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(Error::CreateRuntime)?;
        runtime.block_on(main_loop(args, parameters, qos))
    }

    async fn main_loop(
        args: Args,
        parameters: Vec<RegisterIndex>,
        qos: QoS,
    ) -> Result<(), Error> {
        let mut options =
            rumqttc::v5::MqttOptions::new(args.client_id.clone(), args.host.clone(), args.port);
        options.set_keep_alive(Duration::from_secs(60));
        if let (Some(username), Some(password)) = (&args.username, &args.password) {
            options.set_credentials(username.clone(), password.clone());
        }
        let (mqtt, mut event_loop) = rumqttc::v5::AsyncClient::new(options, 16);
        // rumqttc reconnects on its own for as long as the event loop keeps
        // being polled; all this task does beyond that is pace the retries.
        tokio::task::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(event) => trace!(?event, "mqtt event"),
                    Err(e) => {
                        warn!(
                            error = &e as &dyn std::error::Error,
                            "mqtt connection error, will retry"
                        );
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });
        let connection = Connection::new(args.connection.clone());
        let topic = format!("{}/values", args.topic);
        let mut ticker = tokio::time::interval(*args.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let values = match connection.read_cycle(&parameters).await {
                Ok(values) => values,
                Err(e) => {
                    warn!(
                        error = &e as &dyn std::error::Error,
                        "read cycle did not run, will retry next interval"
                    );
                    continue;
                }
            };
            if values.is_empty() {
                warn!("no values received from the meter this cycle");
                continue;
            }
            let payload = serde_json::to_vec(&values).map_err(Error::Serialize)?;
            mqtt.publish(topic.as_str(), qos, args.retain, payload)
                .await
                .map_err(Error::Publish)?;
            info!(topic = %topic, count = values.len(), "published meter values");
        }
    }
}
