//! Ground truth fleet for simulation.
//!
//! The Oracle owns the "true" position of every simulated bus and moves
//! them each step. Scenarios publish its snapshots through the broker and
//! compare what a session ends up showing against it.

use busgrid_core::{GridSpec, Partitioned, VehicleRecord};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Meters per degree of latitude (spherical approximation).
const METERS_PER_DEGREE: f64 = 111_320.0;

/// A ground truth bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimBus {
    pub id: u64,
    pub route_id: String,
    pub latitude: f64,
    pub longitude: f64,

    /// Heading in radians, 0 = north, clockwise
    pub heading: f64,

    /// Ground speed in m/s
    pub speed: f64,
}

impl SimBus {
    /// The record a feed would publish for this bus.
    pub fn record(&self, timestamp: u64) -> VehicleRecord {
        VehicleRecord::new(
            format!("bus-{}", self.id),
            self.latitude,
            self.longitude,
            self.route_id.clone(),
            self.speed,
        )
        .with_trip(format!("trip-{}-{}", self.route_id, self.id))
        .with_timestamp(timestamp)
    }
}

/// The Oracle - maintains ground truth and moves the fleet.
pub struct FleetOracle {
    /// RNG for spawn positions and speed changes
    rng: ChaCha8Rng,

    /// Speed jitter per step (m/s standard deviation)
    speed_jitter_std: f64,

    grid: GridSpec,

    /// All buses by ID
    buses: BTreeMap<u64, SimBus>,

    next_id: u64,

    /// Current simulation time (seconds)
    current_time: f64,
}

impl FleetOracle {
    /// Creates an empty Oracle with the given seed.
    pub fn new(seed: u64, grid: GridSpec) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            speed_jitter_std: 0.5,
            grid,
            buses: BTreeMap::new(),
            next_id: 0,
            current_time: 0.0,
        }
    }

    /// Spawns `count` buses at random positions inside the grid.
    pub fn spawn_fleet(&mut self, count: usize) {
        for _ in 0..count {
            let latitude = self.rng.gen_range(self.grid.lat_min..self.grid.lat_max);
            let longitude = self.rng.gen_range(self.grid.lon_min..self.grid.lon_max);
            let heading = self.rng.gen_range(0.0..std::f64::consts::TAU);
            let speed = self.rng.gen_range(2.0..20.0);
            let route = self.rng.gen_range(1..100u32);
            self.spawn_bus(latitude, longitude, heading, speed, &route.to_string());
        }
    }

    /// Spawns one bus and returns its ID.
    pub fn spawn_bus(
        &mut self,
        latitude: f64,
        longitude: f64,
        heading: f64,
        speed: f64,
        route_id: &str,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;

        self.buses.insert(
            id,
            SimBus {
                id,
                route_id: route_id.to_string(),
                latitude,
                longitude,
                heading,
                speed,
            },
        );
        id
    }

    /// Moves a bus instantly (e.g. across a cell boundary).
    pub fn teleport(&mut self, id: u64, latitude: f64, longitude: f64) -> bool {
        match self.buses.get_mut(&id) {
            Some(bus) => {
                bus.latitude = latitude;
                bus.longitude = longitude;
                true
            }
            None => false,
        }
    }

    /// Takes a bus out of service.
    pub fn retire(&mut self, id: u64) -> Option<SimBus> {
        self.buses.remove(&id)
    }

    /// Advances every bus by `dt` seconds, bouncing off the grid edges.
    pub fn step(&mut self, dt: f64) {
        let grid = &self.grid;

        for bus in self.buses.values_mut() {
            let z: f64 = self.rng.sample(StandardNormal);
            let jitter = z * self.speed_jitter_std;
            bus.speed = (bus.speed + jitter).clamp(0.0, 25.0);

            let north_m = bus.speed * bus.heading.cos() * dt;
            let east_m = bus.speed * bus.heading.sin() * dt;

            let mut lat = bus.latitude + north_m / METERS_PER_DEGREE;
            let mut lon =
                bus.longitude + east_m / (METERS_PER_DEGREE * bus.latitude.to_radians().cos());

            if lat < grid.lat_min || lat > grid.lat_max {
                bus.heading = std::f64::consts::PI - bus.heading;
                lat = lat.clamp(grid.lat_min, grid.lat_max);
            }
            if lon < grid.lon_min || lon > grid.lon_max {
                bus.heading = -bus.heading;
                lon = lon.clamp(grid.lon_min, grid.lon_max);
            }

            bus.latitude = lat;
            bus.longitude = lon;
        }

        self.current_time += dt;
    }

    /// Feed snapshot of the whole fleet, ordered by bus ID.
    pub fn snapshot(&self, timestamp: u64) -> Vec<VehicleRecord> {
        self.buses.values().map(|b| b.record(timestamp)).collect()
    }

    /// The snapshot split the way a publisher would split it.
    pub fn partitioned(&self, timestamp: u64) -> Partitioned {
        self.grid.partition(self.snapshot(timestamp))
    }

    pub fn bus(&self, id: u64) -> Option<&SimBus> {
        self.buses.get(&id)
    }

    pub fn bus_count(&self) -> usize {
        self.buses.len()
    }

    pub fn grid(&self) -> &GridSpec {
        &self.grid
    }

    /// Returns the current simulation time.
    pub fn time(&self) -> f64 {
        self.current_time
    }
}
