use ethers::prelude::abigen;

abigen!(
    IDistributor,
    r#"[
        function roots(address token) external view returns (bytes32)
    ]"#
);
