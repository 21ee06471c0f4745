// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Physical platform description: clusters of processing elements sharing a
//! memory unit. Intra-cluster communication is free; inter-cluster transfers
//! are costed by user-provided routines.

use crate::Error;

pub type PeId = usize;
pub type ClusterId = usize;
/// Index of a local runtime worker; only `PeKind::LrtPe` elements host one.
pub type LrtId = usize;

/// Communication cost of moving `bytes` between two clusters.
pub type ClusterCostRoutine = fn(ClusterId, ClusterId, u64) -> u64;
/// Cost of reading (resp. writing) `bytes` from a cluster's memory unit.
pub type MemoryCostRoutine = fn(u64) -> u64;

fn default_cluster_cost(from: ClusterId, to: ClusterId, bytes: u64) -> u64 {
    if from == to {
        0
    } else {
        bytes
    }
}

fn default_memory_cost(bytes: u64) -> u64 {
    bytes
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeKind {
    /// Hosts a local runtime worker thread.
    LrtPe,
    /// Raw accelerator driven by another PE's LRT; never dequeues jobs itself.
    PeOnly,
}

#[derive(Clone, Debug)]
pub struct MemoryUnit {
    base: u64,
    size: u64,
    used: u64,
}

impl MemoryUnit {
    pub fn new(base: u64, size: u64) -> Self {
        Self { base, size, used: 0 }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn available(&self) -> u64 {
        self.size - self.used
    }

    /// Reserve `bytes` permanently (persistent delay storage).
    pub fn reserve(&mut self, bytes: u64) -> Result<u64, Error> {
        if bytes > self.available() {
            return Err(Error::AllocationFailure {
                requested: bytes,
                capacity: self.size,
            });
        }
        let address = self.base + self.used;
        self.used += bytes;
        Ok(address)
    }
}

#[derive(Clone, Debug)]
pub struct Pe {
    name: String,
    hw_type: u32,
    hw_id: u32,
    virt_ix: PeId,
    cluster: ClusterId,
    kind: PeKind,
    lrt: Option<LrtId>,
    enabled: bool,
}

impl Pe {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hw_type(&self) -> u32 {
        self.hw_type
    }

    pub fn hw_id(&self) -> u32 {
        self.hw_id
    }

    pub fn virt_ix(&self) -> PeId {
        self.virt_ix
    }

    pub fn cluster(&self) -> ClusterId {
        self.cluster
    }

    pub fn kind(&self) -> PeKind {
        self.kind
    }

    /// The LRT that dequeues jobs mapped on this PE.
    pub fn lrt(&self) -> Option<LrtId> {
        self.lrt
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }
}

pub struct Cluster {
    ix: ClusterId,
    pes: Vec<PeId>,
    memory: MemoryUnit,
    read_cost: MemoryCostRoutine,
    write_cost: MemoryCostRoutine,
}

impl Cluster {
    pub fn ix(&self) -> ClusterId {
        self.ix
    }

    pub fn pes(&self) -> &[PeId] {
        &self.pes
    }

    pub fn memory(&self) -> &MemoryUnit {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut MemoryUnit {
        &mut self.memory
    }

    pub fn read_cost(&self, bytes: u64) -> u64 {
        (self.read_cost)(bytes)
    }

    pub fn write_cost(&self, bytes: u64) -> u64 {
        (self.write_cost)(bytes)
    }
}

/// The physical platform. One per session; the runtime platform (worker
/// threads and queues) is spawned from this description.
pub struct Platform {
    clusters: Vec<Cluster>,
    pes: Vec<Pe>,
    cluster_cost: ClusterCostRoutine,
    grt: Option<PeId>,
    lrt_count: usize,
}

impl Platform {
    pub fn new(cluster_count: usize) -> Self {
        Self {
            clusters: Vec::with_capacity(cluster_count),
            pes: Vec::new(),
            cluster_cost: default_cluster_cost,
            grt: None,
            lrt_count: 0,
        }
    }

    pub fn create_cluster(&mut self, memory: MemoryUnit) -> ClusterId {
        let ix = self.clusters.len();
        self.clusters.push(Cluster {
            ix,
            pes: Vec::new(),
            memory,
            read_cost: default_memory_cost,
            write_cost: default_memory_cost,
        });
        ix
    }

    pub fn create_pe(
        &mut self,
        hw_type: u32,
        hw_id: u32,
        cluster: ClusterId,
        name: &str,
        kind: PeKind,
    ) -> Result<PeId, Error> {
        if cluster >= self.clusters.len() {
            return Err(Error::InvalidIndex {
                entity: "cluster",
                index: cluster,
            });
        }
        let virt_ix = self.pes.len();
        let lrt = match kind {
            PeKind::LrtPe => {
                let lrt = self.lrt_count;
                self.lrt_count += 1;
                Some(lrt)
            }
            PeKind::PeOnly => None,
        };
        self.pes.push(Pe {
            name: name.to_string(),
            hw_type,
            hw_id,
            virt_ix,
            cluster,
            kind,
            lrt,
            enabled: true,
        });
        self.clusters[cluster].pes.push(virt_ix);
        Ok(virt_ix)
    }

    pub fn pe(&self, ix: PeId) -> &Pe {
        &self.pes[ix]
    }

    pub fn pes(&self) -> &[Pe] {
        &self.pes
    }

    pub fn pe_count(&self) -> usize {
        self.pes.len()
    }

    pub fn cluster(&self, ix: ClusterId) -> &Cluster {
        &self.clusters[ix]
    }

    pub fn cluster_mut(&mut self, ix: ClusterId) -> &mut Cluster {
        &mut self.clusters[ix]
    }

    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    pub fn cluster_of(&self, pe: PeId) -> ClusterId {
        self.pes[pe].cluster
    }

    pub fn lrt_count(&self) -> usize {
        self.lrt_count
    }

    pub fn set_enabled(&mut self, pe: PeId, enabled: bool) -> Result<(), Error> {
        let pe = self.pes.get_mut(pe).ok_or(Error::InvalidIndex {
            entity: "PE",
            index: pe,
        })?;
        pe.enabled = enabled;
        Ok(())
    }

    /// Designate the PE whose thread doubles as the global runtime.
    pub fn set_grt(&mut self, pe: PeId) -> Result<(), Error> {
        if pe >= self.pes.len() {
            return Err(Error::InvalidIndex {
                entity: "PE",
                index: pe,
            });
        }
        self.grt = Some(pe);
        Ok(())
    }

    pub fn grt(&self) -> Option<PeId> {
        self.grt
    }

    pub fn set_cluster_cost_routine(&mut self, routine: ClusterCostRoutine) {
        self.cluster_cost = routine;
    }

    pub fn set_read_cost_routine(&mut self, cluster: ClusterId, routine: MemoryCostRoutine) {
        self.clusters[cluster].read_cost = routine;
    }

    pub fn set_write_cost_routine(&mut self, cluster: ClusterId, routine: MemoryCostRoutine) {
        self.clusters[cluster].write_cost = routine;
    }

    /// Cost of moving `bytes` from the cluster of `src` to the cluster of
    /// `dst`; zero within a cluster.
    pub fn comm_cost(&self, src: PeId, dst: PeId, bytes: u64) -> u64 {
        let from = self.cluster_of(src);
        let to = self.cluster_of(dst);
        if from == to {
            0
        } else {
            (self.cluster_cost)(from, to, bytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_cluster_platform() -> Platform {
        let mut platform = Platform::new(2);
        let c0 = platform.create_cluster(MemoryUnit::new(0, 1024));
        let c1 = platform.create_cluster(MemoryUnit::new(1024, 1024));
        platform.create_pe(0, 0, c0, "core0", PeKind::LrtPe).unwrap();
        platform.create_pe(0, 1, c0, "core1", PeKind::LrtPe).unwrap();
        platform.create_pe(1, 0, c1, "accel0", PeKind::LrtPe).unwrap();
        platform
    }

    #[test]
    fn test_lrt_assignment() {
        let platform = two_cluster_platform();
        assert_eq!(platform.lrt_count(), 3);
        assert_eq!(platform.pe(0).lrt(), Some(0));
        assert_eq!(platform.pe(2).lrt(), Some(2));
    }

    #[test]
    fn test_comm_cost_zero_within_cluster() {
        let platform = two_cluster_platform();
        assert_eq!(platform.comm_cost(0, 1, 128), 0);
        assert_eq!(platform.comm_cost(0, 2, 128), 128);
    }

    #[test]
    fn test_memory_reservation() {
        let mut platform = two_cluster_platform();
        let addr = platform.clusters[0].memory_mut().reserve(512).unwrap();
        assert_eq!(addr, 0);
        let addr = platform.clusters[0].memory_mut().reserve(512).unwrap();
        assert_eq!(addr, 512);
        assert!(matches!(
            platform.clusters[0].memory_mut().reserve(1),
            Err(Error::AllocationFailure { .. })
        ));
    }
}
