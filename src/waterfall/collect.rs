//! Grouping the markers of a block into [`WaterfallRegion`]s.

use crate::func_at::FuncAt;
use crate::visit::{InnerVisit as _, Visitor};
use crate::waterfall::{
    LastUseOverlap, Marker, MarkerKind, WaterfallConfig, WaterfallError, WaterfallErrorKind,
    WaterfallRegion,
};
use crate::{Block, FxIndexMap, Inst, InstDef, Reg, VReg};
use smallvec::SmallVec;

/// Find all the waterfall regions in `func_at_block`, in order.
///
/// This never modifies anything, and every call starts from scratch (i.e. the
/// result only depends on the instructions in the block).
pub fn collect_regions(
    func_at_block: FuncAt<'_, Block>,
    config: &WaterfallConfig,
) -> Result<SmallVec<[WaterfallRegion; 1]>, WaterfallError> {
    let block = func_at_block.position;
    let mut collector = Collector {
        config,
        block,
        regions: SmallVec::new(),
        open: None,
        closed_last_use_dsts: FxIndexMap::default(),
    };
    for func_at_inst in func_at_block.at_insts() {
        collector.step(func_at_inst.position, func_at_inst.def())?;
    }
    collector.close_open_region()?;
    Ok(collector.regions)
}

struct Collector<'a> {
    config: &'a WaterfallConfig,
    block: Block,

    regions: SmallVec<[WaterfallRegion; 1]>,

    /// The region started by the most recent `waterfall_begin` (if any).
    open: Option<OpenRegion>,

    /// `waterfall_last_use` destinations of all the regions no longer open,
    /// mapped to their region's token.
    closed_last_use_dsts: FxIndexMap<VReg, VReg>,
}

struct OpenRegion {
    token: VReg,
    begin: Inst,
    read_first_lanes: SmallVec<[Inst; 2]>,
    ends: SmallVec<[Inst; 2]>,
    last_uses: SmallVec<[Inst; 2]>,
    last_use_dsts: SmallVec<[VReg; 2]>,

    /// Only ever moves forward, to the latest instruction seen that qualifies.
    final_inst: Option<Inst>,
}

impl Collector<'_> {
    fn error(&self, inst: Inst, kind: WaterfallErrorKind) -> WaterfallError {
        WaterfallError { kind, block: self.block, inst }
    }

    fn step(&mut self, inst: Inst, inst_def: &InstDef) -> Result<(), WaterfallError> {
        let Some(marker) = inst_def.waterfall_marker() else {
            return self.step_non_marker(inst, inst_def);
        };

        if let Marker::Begin { token, .. } = marker {
            self.close_open_region()?;
            let reused = self.regions.iter().find(|region| region.token == token);
            if let Some(region) = reused {
                return Err(self.error(inst, WaterfallErrorKind::OverlappingRegions {
                    found: token,
                    open: region.token,
                }));
            }
            self.open = Some(OpenRegion {
                token,
                begin: inst,
                read_first_lanes: SmallVec::new(),
                ends: SmallVec::new(),
                last_uses: SmallVec::new(),
                last_use_dsts: SmallVec::new(),
                final_inst: None,
            });
            return Ok(());
        }

        let Some(open) = &mut self.open else {
            return Err(
                self.error(inst, WaterfallErrorKind::MarkerOutsideRegion { kind: marker.kind() })
            );
        };
        if marker.token() != open.token {
            let kind =
                WaterfallErrorKind::OverlappingRegions { found: marker.token(), open: open.token };
            return Err(self.error(inst, kind));
        }
        match marker {
            Marker::Begin { .. } => unreachable!(),
            Marker::ReadFirstLane { .. } => open.read_first_lanes.push(inst),
            Marker::End { .. } => {
                open.ends.push(inst);
                open.final_inst = Some(inst);
            }
            Marker::LastUse { dst, .. } => {
                open.last_uses.push(inst);
                open.last_use_dsts.push(dst);
            }
        }
        Ok(())
    }

    fn step_non_marker(&mut self, inst: Inst, inst_def: &InstDef) -> Result<(), WaterfallError> {
        let mut reads = RegReads(SmallVec::new());
        inst_def.inner_visit_with(&mut reads);

        if let Some(open) = &mut self.open {
            let reads_last_use_dst = |&reg: &Reg| {
                open.last_use_dsts.iter().any(|&dst| reg == Reg::Virt(dst))
            };
            if reads.0.iter().any(reads_last_use_dst) {
                open.final_inst = Some(inst);
            }
        }

        if self.config.last_use_overlap == LastUseOverlap::Reject {
            for reg in reads.0 {
                let Reg::Virt(vreg) = reg else { continue };
                if let Some(&found) = self.closed_last_use_dsts.get(&vreg) {
                    let open = self.open.as_ref().map_or(found, |open| open.token);
                    return Err(
                        self.error(inst, WaterfallErrorKind::OverlappingRegions { found, open })
                    );
                }
            }
        }
        Ok(())
    }

    fn close_open_region(&mut self) -> Result<(), WaterfallError> {
        let Some(open) = self.open.take() else {
            return Ok(());
        };
        let OpenRegion {
            token,
            begin,
            read_first_lanes,
            ends,
            last_uses,
            last_use_dsts,
            final_inst,
        } = open;

        let missing = if read_first_lanes.is_empty() {
            Some(MarkerKind::ReadFirstLane)
        } else if ends.is_empty() && last_uses.is_empty() {
            Some(MarkerKind::End)
        } else {
            None
        };
        if let Some(missing) = missing {
            return Err(self.error(begin, WaterfallErrorKind::MalformedRegion { missing }));
        }

        // A region with only `waterfall_last_use` markers, none of which have
        // their destinations used, ends at its last marker.
        let final_inst = final_inst.or(last_uses.last().copied()).unwrap_or(begin);

        self.closed_last_use_dsts.extend(last_use_dsts.into_iter().map(|dst| (dst, token)));
        self.regions.push(WaterfallRegion {
            token,
            begin,
            read_first_lanes,
            ends,
            last_uses,
            final_inst,
        });
        Ok(())
    }
}

/// Collects every register read by an instruction.
struct RegReads(SmallVec<[Reg; 4]>);

impl Visitor<'_> for RegReads {
    fn visit_reg_use(&mut self, reg: Reg) {
        self.0.push(reg);
    }
}
