use serde::{Deserialize, Serialize};

pub const UNIT_CUBIC_METERS: &str = "m³";
pub const UNIT_KILO_WATT_HOURS: &str = "kWh";

/// Physical kind of a metering installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MeterType {
    Water,
    Electricity,
    Heat,
}

/// Direction of the energy a counter measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Consumption,
    Export,
}

/// Counters the engine accumulates into cumulative statistics.
///
/// The vendor reports many more counter types (temperatures, battery, flow);
/// those never reach a statistic and fail to parse here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CounterType {
    ColdWater,
    HotWater,
    ElectricityFromGrid,
    ElectricityToGrid,
    Heat,
}

impl CounterType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ColdWater" => Some(Self::ColdWater),
            "HotWater" => Some(Self::HotWater),
            "ElectricityFromGrid" => Some(Self::ElectricityFromGrid),
            "ElectricityToGrid" => Some(Self::ElectricityToGrid),
            "Heat" => Some(Self::Heat),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ColdWater => "ColdWater",
            Self::HotWater => "HotWater",
            Self::ElectricityFromGrid => "ElectricityFromGrid",
            Self::ElectricityToGrid => "ElectricityToGrid",
            Self::Heat => "Heat",
        }
    }

    pub fn meter_type(self) -> MeterType {
        match self {
            Self::ColdWater | Self::HotWater => MeterType::Water,
            Self::ElectricityFromGrid | Self::ElectricityToGrid => MeterType::Electricity,
            Self::Heat => MeterType::Heat,
        }
    }

    pub fn role(self) -> Role {
        match self {
            Self::ElectricityToGrid => Role::Export,
            _ => Role::Consumption,
        }
    }

    pub fn unit(self) -> &'static str {
        match self.meter_type() {
            MeterType::Water => UNIT_CUBIC_METERS,
            MeterType::Electricity | MeterType::Heat => UNIT_KILO_WATT_HOURS,
        }
    }
}

/// How a counter's values relate to each other over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ReadingKind {
    /// Values are cumulative meter states; consumption is the difference.
    #[default]
    Counter,
    /// Values are the consumption of the interval they are stamped with.
    Consumption,
}

impl ReadingKind {
    /// Unknown or missing reading types fall back to `Counter`.
    pub fn parse(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("consumption") {
            Self::Consumption
        } else {
            Self::Counter
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Counter {
    pub counter_id: String,
    pub counter_type: CounterType,
    pub reading_kind: ReadingKind,
    pub is_primary: bool,
    pub unit: String,
}

impl Counter {
    pub fn role(&self) -> Role {
        self.counter_type.role()
    }

    pub fn suffix(&self) -> &'static str {
        if self.is_primary {
            "primary"
        } else {
            "secondary"
        }
    }
}

/// A vendor installation and the counters it exposes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meter {
    pub meter_id: String,
    pub installation_type: String,
    pub label: String,
    pub counters: Vec<Counter>,
}

impl Meter {
    pub fn counter(&self, counter_id: &str) -> Option<&Counter> {
        self.counters.iter().find(|c| c.counter_id == counter_id)
    }

    /// Type of the primary counter, or of the first counter if none is flagged.
    pub fn meter_type(&self) -> Option<MeterType> {
        self.counters
            .iter()
            .find(|c| c.is_primary)
            .or_else(|| self.counters.first())
            .map(|c| c.counter_type.meter_type())
    }

    pub fn is_hot_water(&self) -> bool {
        self.installation_type.eq_ignore_ascii_case("hotwater")
    }
}
