// Serial number arithmetic (RFC 1982) for TSNs.

pub(crate) const SERIAL_32_HALF: u32 = 1 << 31;

pub(crate) fn sna32lt(i1: u32, i2: u32) -> bool {
    (i1 < i2 && i2 - i1 < SERIAL_32_HALF) || (i1 > i2 && i1 - i2 > SERIAL_32_HALF)
}

pub(crate) fn sna32lte(i1: u32, i2: u32) -> bool {
    i1 == i2 || sna32lt(i1, i2)
}

pub(crate) fn sna32gt(i1: u32, i2: u32) -> bool {
    sna32lt(i2, i1)
}

pub(crate) fn sna32gte(i1: u32, i2: u32) -> bool {
    i1 == i2 || sna32gt(i1, i2)
}
