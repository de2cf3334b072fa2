use std::collections::BTreeMap;

use crate::loader::Symbols;

/// Samples the program counter every `interval` retired instructions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Profiler {
    interval: u64,
    samples: BTreeMap<u64, u64>,
}

/// A frequently sampled guest address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hotspot {
    pub address: u64,
    pub samples: u64,

    /// Name of the function containing the address, if known.
    pub symbol: Option<String>,

    /// Offset of the address from the start of the function.
    pub offset: u64,
}

impl std::fmt::Display for Hotspot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.symbol {
            Some(symbol) => write!(
                f,
                "{address:#x} {symbol}+{offset:#x}: {samples}",
                address = self.address,
                offset = self.offset,
                samples = self.samples
            ),
            None => write!(
                f,
                "{address:#x}: {samples}",
                address = self.address,
                samples = self.samples
            ),
        }
    }
}

impl Profiler {
    pub fn new(interval: u64) -> Self {
        Self {
            interval: interval.max(1),
            samples: Default::default(),
        }
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    /// Record `pc` if `instret` falls on a sampling boundary.
    pub fn sample(&mut self, instret: u64, pc: u64) {
        if instret % self.interval == 0 {
            *self.samples.entry(pc).or_default() += 1;
        }
    }

    /// Record `pc` once for every sampling boundary in `[before, after)`. Used for translated
    /// blocks whose instructions are not observed individually.
    pub fn sample_range(&mut self, before: u64, after: u64, pc: u64) {
        let boundaries = after.div_ceil(self.interval) - before.div_ceil(self.interval);
        if boundaries > 0 {
            *self.samples.entry(pc).or_default() += boundaries;
        }
    }

    pub fn samples(&self) -> &BTreeMap<u64, u64> {
        &self.samples
    }

    pub(crate) fn set_samples(&mut self, samples: BTreeMap<u64, u64>) {
        self.samples = samples;
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// The `count` most sampled addresses, most frequent first. Ties are ordered by address.
    pub fn hotspots(&self, count: usize, symbols: &Symbols) -> Vec<Hotspot> {
        let mut samples: Vec<(u64, u64)> = self
            .samples
            .iter()
            .map(|(&address, &samples)| (address, samples))
            .collect();
        samples.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        samples
            .into_iter()
            .take(count)
            .map(|(address, samples)| {
                let (symbol, offset) = match symbols.containing(address) {
                    Some(symbol) => (Some(symbol.name.clone()), address - symbol.address),
                    None => (None, 0),
                };
                Hotspot {
                    address,
                    samples,
                    symbol,
                    offset,
                }
            })
            .collect()
    }
}
