//! Model package address maps.
//!
//! Each line is `<region-key> <hex-address> <hex-size>`; lines with fewer
//! fields or an unknown key are ignored.

use super::{AcceleratorError, Region, RegionKind, RegionTable, REGION_COUNT};
use hashbrown::HashMap;

pub use crate::configuration::Addressing;

pub const ADDRESS_MAP_SUFFIX: &str = "addrmap_intm.txt";

#[derive(Debug, Clone, Default)]
pub struct AddressMap {
    entries: HashMap<RegionKind, Region>,
}

fn parse_hex(token: &str, line: usize) -> Result<u32, AcceleratorError> {
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token);
    u32::from_str_radix(digits, 16).map_err(|e| AcceleratorError::InvalidAddressMap {
        line,
        reason: format!("{:?}: {}", token, e),
    })
}

impl AddressMap {
    pub fn parse(text: &str) -> Result<Self, AcceleratorError> {
        let mut entries = HashMap::new();
        for (n, line) in text.lines().enumerate() {
            let mut tokens = line.split_whitespace();
            let (Some(key), Some(address), Some(size)) = (tokens.next(), tokens.next(), tokens.next())
            else {
                continue;
            };
            let Some(kind) = RegionKind::from_key(key) else {
                continue;
            };
            let region = Region {
                address: parse_hex(address, n + 1)?,
                size: parse_hex(size, n + 1)?,
            };
            entries.insert(kind, region);
        }
        Ok(Self { entries })
    }

    pub fn get(&self, kind: RegionKind) -> Option<Region> {
        self.entries.get(&kind).copied()
    }

    /// Produces the driver region table. Input and output regions are
    /// mandatory; any other region missing from the map stays zeroed.
    pub fn resolve(
        &self,
        area: Region,
        addressing: Addressing,
    ) -> Result<RegionTable, AcceleratorError> {
        let input = self
            .get(RegionKind::Input)
            .ok_or(AcceleratorError::MissingRegion(RegionKind::Input))?;
        if self.get(RegionKind::Output).is_none() {
            return Err(AcceleratorError::MissingRegion(RegionKind::Output));
        }

        let mut table = [Region::default(); REGION_COUNT];
        for (kind, region) in &self.entries {
            let address = match addressing {
                Addressing::Absolute => region.address,
                Addressing::Relative => region
                    .address
                    .wrapping_sub(input.address)
                    .wrapping_add(area.address),
            };
            table[kind.index()] = Region {
                address,
                size: region.size,
            };
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AREA: Region = Region {
        address: 0x8000_0000,
        size: 0x2000_0000,
    };

    #[test]
    fn test_relative_rebasing() -> anyhow::Result<()> {
        let map = AddressMap::parse(
            "input 00001000 00000c00\n\
             drp_config 00002000 00000400\n\
             weight 00010000 00100000\n\
             data_out 00003000 00000200\n",
        )?;
        let table = map.resolve(AREA, Addressing::Relative)?;
        assert_eq!(table[RegionKind::Input.index()].address, 0x8000_0000);
        assert_eq!(table[RegionKind::Input.index()].size, 0xc00);
        assert_eq!(
            table[RegionKind::DrpConfig.index()].address,
            0x2000 - 0x1000 + 0x8000_0000
        );
        assert_eq!(
            table[RegionKind::Weight.index()].address,
            0x10000 - 0x1000 + 0x8000_0000
        );
        assert_eq!(
            table[RegionKind::Output.index()].address,
            0x3000 - 0x1000 + 0x8000_0000
        );
        Ok(())
    }

    #[test]
    fn test_absolute_addresses_kept() -> anyhow::Result<()> {
        let map = AddressMap::parse("data_in 80001000 100\ndata_out 80002000 100\n")?;
        let table = map.resolve(AREA, Addressing::Absolute)?;
        assert_eq!(table[RegionKind::Input.index()].address, 0x8000_1000);
        assert_eq!(table[RegionKind::Output.index()].address, 0x8000_2000);
        Ok(())
    }

    #[test]
    fn test_relative_map_on_zero_based_area() -> anyhow::Result<()> {
        // the area covers the small offsets, which must still be rebased
        let area = Region {
            address: 0,
            size: 0x4000_0000,
        };
        let map = AddressMap::parse("data_in 1000 100
weight 3000 200
data_out 2000 100
")?;
        let table = map.resolve(area, Addressing::default())?;
        assert_eq!(table[RegionKind::Input.index()].address, 0);
        assert_eq!(table[RegionKind::Output.index()].address, 0x1000);
        assert_eq!(table[RegionKind::Weight.index()].address, 0x2000);
        Ok(())
    }

    #[test]
    fn test_short_and_unknown_lines_ignored() -> anyhow::Result<()> {
        let map = AddressMap::parse(
            "# header\n\
             data_in 0\n\
             unknown 10 20\n\
             data_out 0x40 0x10 trailing\n",
        )?;
        assert!(map.get(RegionKind::Input).is_none());
        assert_eq!(
            map.get(RegionKind::Output),
            Some(Region {
                address: 0x40,
                size: 0x10
            })
        );
        Ok(())
    }

    #[test]
    fn test_missing_mandatory_region() -> anyhow::Result<()> {
        let map = AddressMap::parse("data_out 0 10\n")?;
        assert!(matches!(
            map.resolve(AREA, Addressing::Relative),
            Err(AcceleratorError::MissingRegion(RegionKind::Input))
        ));
        let map = AddressMap::parse("data_in 0 10\n")?;
        assert!(matches!(
            map.resolve(AREA, Addressing::Relative),
            Err(AcceleratorError::MissingRegion(RegionKind::Output))
        ));
        Ok(())
    }

    #[test]
    fn test_bad_hex() {
        let err = AddressMap::parse("weight zz 10\n").unwrap_err();
        assert!(matches!(err, AcceleratorError::InvalidAddressMap { line: 1, .. }));
    }
}
