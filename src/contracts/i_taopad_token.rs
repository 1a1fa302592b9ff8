use ethers::prelude::abigen;

abigen!(
    ITaopadToken,
    r#"[
        function name() external view returns (string)
        function symbol() external view returns (string)
        function decimals() external view returns (uint8)
        function totalSupply() external view returns (uint256)
        function balanceOf(address account) external view returns (uint256)
        function isBlacklisted(address account) external view returns (bool)
        function operator() external view returns (address)
        event Transfer(address indexed from, address indexed to, uint256 value)
    ]"#
);
