//! Service name resolution
//!
//! A [`ServiceMapper`] turns a logical service name into candidate servers.
//! Duplicate entries are weights: a server added three times is tried three
//! times per cycle.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use rand::Rng;

use crate::error::{Error, Result};

/// A physical server reference
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerRef {
    /// Server name as known to the application
    pub name: String,
    /// Address handed to the driver
    pub host: String,
    /// Port, if not the driver default
    pub port: Option<u16>,
}

impl ServerRef {
    /// Reference where name and host coincide
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            host: name.clone(),
            name,
            port: None,
        }
    }

    /// Set a distinct host
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Parse `host[:port]`
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(Error::config("server reference cannot be empty"));
        }
        match input.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port
                    .parse()
                    .map_err(|_| Error::config(format!("invalid port in server reference: {input}")))?;
                Ok(Self::new(host).with_port(port))
            }
            Some(_) => Err(Error::config(format!("invalid server reference: {input}"))),
            None => Ok(Self::new(input)),
        }
    }
}

impl fmt::Display for ServerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.host, port),
            None => f.write_str(&self.host),
        }
    }
}

/// Resolves service names to servers
pub trait ServiceMapper: Send + Sync {
    /// Next server for a service, `None` if the service is unknown
    fn get_server(&self, service: &str) -> Option<ServerRef>;

    /// Entries in one full cycle for a service
    fn candidate_count(&self, service: &str) -> usize;

    /// Candidates for one connection request, most preferred first
    fn candidates(&self, service: &str) -> Vec<ServerRef> {
        (0..self.candidate_count(service))
            .filter_map(|_| self.get_server(service))
            .collect()
    }

    /// Mapper name for logs
    fn name(&self) -> &str;
}

#[derive(Debug, Default)]
struct PriorityEntry {
    servers: Vec<ServerRef>,
    next: usize,
}

/// Cycles through servers in insertion order
#[derive(Debug, Default)]
pub struct PriorityMapper {
    services: Mutex<HashMap<String, PriorityEntry>>,
}

impl PriorityMapper {
    /// Empty mapper
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a server to a service
    pub fn add(&self, service: impl Into<String>, server: ServerRef) {
        self.services
            .lock()
            .entry(service.into())
            .or_default()
            .servers
            .push(server);
    }

    /// Builder form of [`Self::add`]
    pub fn with(self, service: impl Into<String>, server: ServerRef) -> Self {
        self.add(service, server);
        self
    }

    /// Remove every entry for `server`; returns how many were removed
    pub fn remove(&self, service: &str, server: &ServerRef) -> usize {
        let mut services = self.services.lock();
        let Some(entry) = services.get_mut(service) else {
            return 0;
        };
        let before = entry.servers.len();
        entry.servers.retain(|s| s != server);
        if entry.next >= entry.servers.len() {
            entry.next = 0;
        }
        before - entry.servers.len()
    }
}

impl ServiceMapper for PriorityMapper {
    fn get_server(&self, service: &str) -> Option<ServerRef> {
        let mut services = self.services.lock();
        let entry = services.get_mut(service)?;
        if entry.servers.is_empty() {
            return None;
        }
        let server = entry.servers[entry.next % entry.servers.len()].clone();
        entry.next = (entry.next + 1) % entry.servers.len();
        Some(server)
    }

    fn candidate_count(&self, service: &str) -> usize {
        self.services
            .lock()
            .get(service)
            .map_or(0, |e| e.servers.len())
    }

    fn candidates(&self, service: &str) -> Vec<ServerRef> {
        let mut services = self.services.lock();
        let Some(entry) = services.get_mut(service) else {
            return Vec::new();
        };
        let n = entry.servers.len();
        if n == 0 {
            return Vec::new();
        }
        let list = (0..n)
            .map(|i| entry.servers[(entry.next + i) % n].clone())
            .collect();
        // each request starts one entry further on
        entry.next = (entry.next + 1) % n;
        list
    }

    fn name(&self) -> &str {
        "priority"
    }
}

/// Picks servers at random, with replacement, proportionally to weight
#[derive(Debug, Default)]
pub struct RandomMapper {
    services: Mutex<HashMap<String, Vec<(ServerRef, u32)>>>,
}

impl RandomMapper {
    /// Empty mapper
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a server with a weight (zero-weight entries are never picked)
    pub fn add(&self, service: impl Into<String>, server: ServerRef, weight: u32) {
        self.services
            .lock()
            .entry(service.into())
            .or_default()
            .push((server, weight));
    }
}

impl ServiceMapper for RandomMapper {
    fn get_server(&self, service: &str) -> Option<ServerRef> {
        let services = self.services.lock();
        let entries = services.get(service)?;
        let total: u64 = entries.iter().map(|(_, w)| u64::from(*w)).sum();
        if total == 0 {
            return None;
        }
        let mut pick = rand::thread_rng().gen_range(0..total);
        for (server, weight) in entries {
            let weight = u64::from(*weight);
            if pick < weight {
                return Some(server.clone());
            }
            pick -= weight;
        }
        None
    }

    fn candidate_count(&self, service: &str) -> usize {
        self.services
            .lock()
            .get(service)
            .map_or(0, |e| e.iter().filter(|(_, w)| *w > 0).count())
    }

    fn name(&self) -> &str {
        "random"
    }
}

/// Treats the service name as the server reference
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleServerMapper;

impl ServiceMapper for SingleServerMapper {
    fn get_server(&self, service: &str) -> Option<ServerRef> {
        ServerRef::parse(service).ok()
    }

    fn candidate_count(&self, service: &str) -> usize {
        usize::from(ServerRef::parse(service).is_ok())
    }

    fn name(&self) -> &str {
        "single"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_ref_parse() {
        let s = ServerRef::parse("MSDEV1:1433").unwrap();
        assert_eq!(s.host, "MSDEV1");
        assert_eq!(s.port, Some(1433));
        assert_eq!(s.to_string(), "MSDEV1:1433");

        assert_eq!(ServerRef::parse("SYB").unwrap(), ServerRef::new("SYB"));
        assert!(ServerRef::parse("").is_err());
        assert!(ServerRef::parse(":1").is_err());
        assert!(ServerRef::parse("h:port").is_err());
    }

    #[test]
    fn test_priority_cycles_in_insertion_order() {
        let s1 = ServerRef::new("S1");
        let s2 = ServerRef::new("S2");
        let mapper = PriorityMapper::new()
            .with("svc", s1.clone())
            .with("svc", s2.clone())
            .with("svc", s1.clone())
            .with("svc", s1.clone());

        let got: Vec<_> = (0..5).map(|_| mapper.get_server("svc").unwrap()).collect();
        assert_eq!(got, vec![s1.clone(), s2, s1.clone(), s1.clone(), s1]);
        assert!(mapper.get_server("other").is_none());
    }

    #[test]
    fn test_priority_candidates_rotate_per_request() {
        let mapper = PriorityMapper::new()
            .with("svc", ServerRef::new("A"))
            .with("svc", ServerRef::new("B"));
        mapper.get_server("svc");

        let names: Vec<_> = mapper
            .candidates("svc")
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["B", "A"]);
        assert_eq!(mapper.get_server("svc").unwrap().name, "A");
        assert_eq!(mapper.candidates("svc")[0].name, "B");
        assert_eq!(mapper.candidates("svc")[0].name, "A");
    }

    #[test]
    fn test_priority_remove() {
        let a = ServerRef::new("A");
        let mapper = PriorityMapper::new()
            .with("svc", a.clone())
            .with("svc", ServerRef::new("B"))
            .with("svc", a.clone());
        assert_eq!(mapper.remove("svc", &a), 2);
        assert_eq!(mapper.candidate_count("svc"), 1);
        assert_eq!(mapper.get_server("svc").unwrap().name, "B");
    }

    #[test]
    fn test_random_respects_weights() {
        let mapper = RandomMapper::new();
        mapper.add("svc", ServerRef::new("A"), 1);
        mapper.add("svc", ServerRef::new("never"), 0);

        for _ in 0..50 {
            assert_eq!(mapper.get_server("svc").unwrap().name, "A");
        }
        assert_eq!(mapper.candidate_count("svc"), 1);
        assert_eq!(mapper.candidates("svc").len(), 1);
    }

    #[test]
    fn test_single_server_mapper() {
        let mapper = SingleServerMapper;
        assert_eq!(mapper.get_server("HOST:2638").unwrap().port, Some(2638));
        assert_eq!(mapper.candidate_count(""), 0);
    }
}
