/// Every register the Multical 402 exposes over its optical/serial interface,
/// tabulated once. Names are lowercase configuration keys; `_m` suffixes the
/// running month, `_y` the running year.
macro_rules! for_each_register {
    ($m:ident) => {
        $m! {
            0x003C: "energy", "Heat energy (E1), GJ";
            0x0044: "volume", "Volume consumption, m3";
            0x004A: "flow", "Current flow rate, l/h";
            0x0050: "power", "Current power, kW";
            0x0056: "temp1", "Inlet temperature, C";
            0x0057: "temp2", "Outlet temperature, C";
            0x0059: "tempdiff", "Temperature difference, C";
            0x0061: "temp1xm3", "Temperature 1 times volume";
            0x006E: "temp2xm3", "Temperature 2 times volume";
            0x0071: "infoevent", "Information event register";
            0x007B: "maxflowdate_y", "Date of maximum flow this year";
            0x007C: "maxflow_y", "Maximum flow this year";
            0x007D: "minflowdate_y", "Date of minimum flow this year";
            0x007E: "minflow_y", "Minimum flow this year";
            0x007F: "maxpowerdate_y", "Date of maximum power this year";
            0x0080: "maxpower_y", "Maximum power this year";
            0x0081: "minpowerdate_y", "Date of minimum power this year";
            0x0082: "minpower_y", "Minimum power this year";
            0x008A: "maxflowdate_m", "Date of maximum flow this month";
            0x008B: "maxflow_m", "Maximum flow this month";
            0x008C: "minflowdate_m", "Date of minimum flow this month";
            0x008D: "minflow_m", "Minimum flow this month";
            0x008E: "maxpowerdate_m", "Date of maximum power this month";
            0x008F: "maxpower_m", "Maximum power this month";
            0x0090: "minpowerdate_m", "Date of minimum power this month";
            0x0091: "minpower_m", "Minimum power this month";
            0x0092: "avgtemp1_y", "Average inlet temperature this year";
            0x0093: "avgtemp2_y", "Average outlet temperature this year";
            0x0095: "avgtemp1_m", "Average inlet temperature this month";
            0x0096: "avgtemp2_m", "Average outlet temperature this month";
            0x03EC: "hourcounter", "Hour counter";
        }
    };
}

macro_rules! define_tables {
    ($($address:literal: $name:literal, $description:literal;)*) => {
        pub const ADDRESSES: &[u16] = &[$($address),*];
        pub const NAMES: &[&str] = &[$($name),*];
        pub const DESCRIPTIONS: &[&str] = &[$($description),*];
    };
}

for_each_register!(define_tables);

const _ASSERT_ADDRESSES_SORTED: () = const {
    let mut idx = 1;
    while idx < ADDRESSES.len() {
        assert!(
            ADDRESSES[idx - 1] < ADDRESSES[idx],
            "register table must stay sorted by address for binary lookup"
        );
        idx += 1;
    }
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterIndex(usize);

impl RegisterIndex {
    pub fn from_address(address: u16) -> Option<RegisterIndex> {
        let index = ADDRESSES.partition_point(|v| *v < address);
        (ADDRESSES.get(index) == Some(&address)).then_some(Self(index))
    }

    pub fn from_name(name: &str) -> Option<RegisterIndex> {
        let index = NAMES.iter().position(|v| *v == name);
        index.map(Self)
    }

    pub fn all() -> impl Iterator<Item = RegisterIndex> {
        (0..ADDRESSES.len()).map(Self)
    }

    pub fn address(&self) -> u16 {
        ADDRESSES[self.0]
    }

    pub fn name(&self) -> &'static str {
        NAMES[self.0]
    }

    pub fn description(&self) -> &'static str {
        DESCRIPTIONS[self.0]
    }
}
