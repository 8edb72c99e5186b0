//! Manage command line arguments here.
use std::io;
use std::net::IpAddr;

use clap::{App, Arg};

use mdnslib::client::QueryMode;
use mdnslib::error::MdnsResult;

/// This structure holds the command line arguments.
#[derive(Debug)]
pub struct CliOptions {
    pub service_type: String,
    pub resolve: Option<String>,
    pub subtypes: Vec<String>,
    pub mode: QueryMode,
    pub advertise: Option<(String, u16)>,
    pub addresses: Vec<IpAddr>,
    pub hostname: String,
    pub debug: bool,
}

impl CliOptions {
    pub fn options() -> MdnsResult<Self> {
        let matches = App::new("mDNS browse tool")
            .version("0.1")
            .about(
                r#"Browse, resolve and advertise DNS-SD services over mDNS

            Example: mdnsbrowse -t _http._tcp
            "#,
            )
            .arg(
                Arg::new("type")
                    .short('t')
                    .long("type")
                    .required(true)
                    .long_help("Service type to browse, e.g. _http._tcp")
                    .takes_value(true),
            )
            .arg(
                Arg::new("resolve")
                    .short('r')
                    .long("resolve")
                    .required(false)
                    .long_help("Resolve a single instance of the service type")
                    .takes_value(true),
            )
            .arg(
                Arg::new("subtype")
                    .short('s')
                    .long("subtype")
                    .required(false)
                    .multiple_occurrences(true)
                    .long_help("Restrict discovery to a subtype; repeatable")
                    .takes_value(true),
            )
            .arg(
                Arg::new("mode")
                    .short('m')
                    .long("mode")
                    .required(false)
                    .long_help("Query pacing: active, passive or aggressive")
                    .takes_value(true),
            )
            .arg(
                Arg::new("advertise")
                    .short('a')
                    .long("advertise")
                    .required(false)
                    .long_help("Also advertise an instance, as NAME:PORT")
                    .takes_value(true),
            )
            .arg(
                Arg::new("addr")
                    .long("addr")
                    .required(false)
                    .multiple_occurrences(true)
                    .long_help("Address to advertise for this host; repeatable")
                    .takes_value(true),
            )
            .arg(
                Arg::new("hostname")
                    .long("hostname")
                    .required(false)
                    .long_help("Host label to advertise under (default mdnsbrowse)")
                    .takes_value(true),
            )
            .arg(
                Arg::new("debug")
                    .short('g')
                    .long("debug")
                    .required(false)
                    .long_help("Hex-dump every inbound datagram")
                    .takes_value(false),
            )
            .get_matches();

        let service_type = String::from(matches.value_of("type").unwrap());
        let resolve = matches.value_of("resolve").map(String::from);
        let subtypes = matches
            .values_of("subtype")
            .map(|v| v.map(String::from).collect())
            .unwrap_or_default();

        let mode = match matches.value_of("mode").unwrap_or("active") {
            "active" => QueryMode::Active,
            "passive" => QueryMode::Passive,
            "aggressive" => QueryMode::Aggressive,
            other => return Err(bad_arg(&format!("unknown mode <{}>", other))),
        };

        let advertise = match matches.value_of("advertise") {
            Some(spec) => {
                let (name, port) = spec
                    .rsplit_once(':')
                    .ok_or_else(|| bad_arg("advertise spec must be NAME:PORT"))?;
                let port: u16 = port
                    .parse()
                    .map_err(|_| bad_arg("advertise port is not a number"))?;
                Some((String::from(name), port))
            }
            None => None,
        };

        let mut addresses = Vec::new();
        if let Some(values) = matches.values_of("addr") {
            for value in values {
                let addr: IpAddr = value
                    .parse()
                    .map_err(|_| bad_arg(&format!("bad address <{}>", value)))?;
                addresses.push(addr);
            }
        }

        let hostname = String::from(matches.value_of("hostname").unwrap_or("mdnsbrowse"));
        let debug = matches.is_present("debug");

        Ok(CliOptions {
            service_type,
            resolve,
            subtypes,
            mode,
            advertise,
            addresses,
            hostname,
            debug,
        })
    }
}

fn bad_arg(msg: &str) -> mdnslib::error::MdnsError {
    io::Error::new(io::ErrorKind::InvalidInput, msg.to_string()).into()
}
